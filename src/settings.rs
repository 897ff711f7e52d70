use {
    buscore::ExecutorConfig,
    error_reporter::Report,
    serde::Deserialize,
    std::{env::var, fmt, fs::File, io::Write, sync::OnceLock, time::Duration},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Session => f.write_str("session"),
            BusKind::System => f.write_str("system"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub bus: BusKind,
    pub call_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Settings {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            call_timeout: self.call_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn get() -> &'static Settings {
    match SETTINGS.get() {
        None => panic!("settings have not been initialized"),
        Some(s) => s,
    }
}

pub fn init(config: Option<&str>) {
    SETTINGS.get_or_init(|| {
        let path_str;
        let path = if let Some(config) = config {
            config
        } else {
            let config_home = match var("XDG_CONFIG_HOME") {
                Ok(h) => h,
                Err(_) => match var("HOME") {
                    Ok(v) => format!("{v}/.config"),
                    Err(_) => {
                        log::error!("Neither $XDG_CONFIG_HOME nor $HOME are defined");
                        log::warn!("Using default config");
                        return Settings::default();
                    }
                },
            };
            let dir = format!("{config_home}/buswatch");
            if let Err(e) = std::fs::create_dir_all(&dir) {
                log::error!("Could not create {dir}: {}", Report::new(e));
                log::warn!("Using default config");
                return Settings::default();
            }
            path_str = format!("{dir}/config.toml");
            if let Ok(mut file) = File::options().create_new(true).write(true).open(&path_str) {
                if let Err(e) = file.write_all(DEFAULT_TOML.as_bytes()) {
                    log::error!(
                        "Could not write default config to {path_str}: {}",
                        Report::new(e)
                    );
                }
            }
            &path_str
        };
        let c = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::error!("Could not read {path}: {}", Report::new(e));
                log::warn!("Using default config");
                return Settings::default();
            }
        };
        deserialize(&c)
    });
}

impl Default for Settings {
    fn default() -> Self {
        deserialize("")
    }
}

const DEFAULT_TOML: &str = include_str!("default.toml");

const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

fn deserialize(s: &str) -> Settings {
    let desired = toml::from_str::<TomlSettings>(s).unwrap_or_else(|e| {
        log::error!("Could not deserialize settings: {}", Report::new(e));
        log::warn!("Falling back to default settings");
        TomlSettings::default()
    });
    let call_timeout = match desired.call_timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let poll_interval_ms = desired
        .poll_interval_ms
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
        .max(1);
    Settings {
        bus: desired.bus.unwrap_or(BusKind::Session),
        call_timeout,
        poll_interval: Duration::from_millis(poll_interval_ms),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TomlSettings {
    bus: Option<BusKind>,
    call_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_deserializes() {
        let s = deserialize("");
        assert_eq!(s.bus, BusKind::Session);
        assert_eq!(s.call_timeout, Some(Duration::from_secs(25)));
        assert_eq!(s.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn default_file_matches_builtin_defaults() {
        let file = toml::from_str::<TomlSettings>(DEFAULT_TOML).unwrap();
        assert_eq!(file.bus, Some(BusKind::Session));
        assert_eq!(file.call_timeout_ms, Some(DEFAULT_CALL_TIMEOUT_MS));
        assert_eq!(file.poll_interval_ms, Some(DEFAULT_POLL_INTERVAL_MS));
    }

    #[test]
    fn zero_timeout_disables_the_limit() {
        let s = deserialize("bus = \"system\"\ncall-timeout-ms = 0\npoll-interval-ms = 0\n");
        assert_eq!(s.bus, BusKind::System);
        assert_eq!(s.call_timeout, None);
        assert_eq!(s.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn malformed_file_falls_back() {
        let s = deserialize("bus = \"carrier-pigeon\"");
        assert_eq!(s.bus, BusKind::Session);
    }
}
