use {
    crate::settings::{self, BusKind},
    buscore::{Bus, Executor, RequestNameFlags, WatchMode, ZbusTransport},
    clap::{Parser, Subcommand, ValueEnum},
    error_reporter::Report,
    std::thread::{self, JoinHandle},
    thiserror::Error,
};

/// buswatch.
///
/// Queries the bus daemon and watches the owners of bus names.
#[derive(Parser, Debug)]
struct Cli {
    /// Path to the config file.
    ///
    /// Defaults to `~/.config/buswatch/config.toml`.
    #[clap(long)]
    config: Option<String>,
    /// The bus to connect to. Overrides the config file.
    #[clap(long, value_enum)]
    bus: Option<BusKind>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all names on the bus.
    Names,
    /// Print the unique name of the owner of a name.
    Owner { name: String },
    /// Print every ownership change of a name.
    Watch {
        name: String,
        /// Which changes to print.
        #[clap(long, value_enum, default_value_t)]
        mode: Mode,
    },
    /// Acquire a name and hold it until the process exits.
    Claim {
        name: String,
        /// Take the name from its current owner if that owner allows it.
        #[clap(long)]
        replace: bool,
    },
}

#[derive(ValueEnum, Copy, Clone, Debug, Default)]
enum Mode {
    #[default]
    OwnerChange,
    Registration,
    Unregistration,
}

impl From<Mode> for WatchMode {
    fn from(value: Mode) -> Self {
        match value {
            Mode::OwnerChange => WatchMode::OwnerChange,
            Mode::Registration => WatchMode::Registration,
            Mode::Unregistration => WatchMode::Unregistration,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Could not connect to the {0} bus")]
    Connect(BusKind, #[source] buscore::Error),
    #[error("Could not spawn the dispatch thread")]
    Spawn(#[source] std::io::Error),
    #[error("The {0} call failed")]
    Call(&'static str, #[source] buscore::Error),
    #[error("Could not watch {0}")]
    Watch(String, #[source] buscore::Error),
    #[error("The dispatch loop failed")]
    Dispatch(#[source] buscore::Error),
    #[error("The dispatch thread panicked")]
    DispatchPanicked,
}

const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

pub fn run() {
    let cli = Cli::parse();

    settings::init(cli.config.as_deref());
    let bus = cli.bus.unwrap_or(settings::get().bus);

    if let Err(e) = execute(bus, cli.command) {
        log::error!("A fatal error occurred: {}", Report::new(e));
        std::process::exit(1);
    }
}

fn execute(kind: BusKind, command: Command) -> Result<(), CliError> {
    let settings = settings::get();
    let transport = match kind {
        BusKind::Session => ZbusTransport::session(),
        BusKind::System => ZbusTransport::system(),
    };
    let transport = transport.map_err(|e| CliError::Connect(kind, e))?;
    let holder = Executor::attach(transport, settings.executor_config());
    let executor = holder.executor.clone();
    let dispatch = thread::Builder::new()
        .name("dispatch".to_string())
        .spawn(move || executor.run())
        .map_err(CliError::Spawn)?;
    let mut bus = Bus::new(&holder.executor);
    if let Some(timeout) = settings.call_timeout {
        bus = bus.with_timeout(timeout);
    }
    match command {
        Command::Names => {
            let mut names = bus
                .list_names()
                .map_err(|e| CliError::Call("ListNames", e))?;
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Command::Owner { name } => {
            let owner = bus
                .get_name_owner(&name)
                .map_err(|e| CliError::Call("GetNameOwner", e))?;
            println!("{owner}");
        }
        Command::Watch { name, mode } => {
            let watcher = bus
                .watch_service(&name, mode.into())
                .map_err(|e| CliError::Watch(name.clone(), e))?;
            let n = name.clone();
            watcher.on_owner_changed(move |old, new| match (old, new) {
                ("", new) => println!("{n}: acquired by {new}"),
                (old, "") => println!("{n}: released by {old}"),
                (old, new) => println!("{n}: moved from {old} to {new}"),
            });
            match bus.get_name_owner(&name) {
                Ok(owner) => log::info!("{name} is currently owned by {owner}"),
                Err(e) if e.remote_name() == Some(NAME_HAS_NO_OWNER) => {
                    log::info!("{name} currently has no owner")
                }
                Err(e) => return Err(CliError::Call("GetNameOwner", e)),
            }
            return join(dispatch);
        }
        Command::Claim { name, replace } => {
            let mut flags = RequestNameFlags::DO_NOT_QUEUE | RequestNameFlags::ALLOW_REPLACEMENT;
            if replace {
                flags = flags | RequestNameFlags::REPLACE_EXISTING;
            }
            let reply = bus
                .request_name(&name, flags)
                .map_err(|e| CliError::Call("RequestName", e))?;
            log::info!("RequestName for {name} replied {reply:?}");
            return join(dispatch);
        }
    }
    holder.executor.stop();
    join(dispatch)
}

fn join(dispatch: JoinHandle<Result<(), buscore::Error>>) -> Result<(), CliError> {
    match dispatch.join() {
        Ok(res) => res.map_err(CliError::Dispatch),
        Err(_) => Err(CliError::DispatchPanicked),
    }
}
