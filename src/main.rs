use log::LevelFilter;

mod cli;
mod settings;

fn main() {
    env_logger::builder()
        .default_format()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
    cli::run();
}
