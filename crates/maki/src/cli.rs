use std::path::PathBuf;

/// Command line arguments.
#[derive(Debug, Default)]
pub(crate) struct Args {
    /// Config directory to use instead of `<config-dir>/sushi`.
    pub(crate) config_dir: Option<PathBuf>,

    /// Data directory (logs, downloads) to use instead of
    /// `<data-dir>/sushi`.
    pub(crate) data_dir: Option<PathBuf>,

    /// Print the version and exit.
    pub(crate) version: bool,
}

pub(crate) fn parse() -> Args {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config-dir" | "-c" => {
                args.config_dir = iter.next().map(PathBuf::from);
            }
            "--data-dir" | "-d" => {
                args.data_dir = iter.next().map(PathBuf::from);
            }
            "--version" | "-v" => {
                args.version = true;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                println!("Unexpected argument: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
    }
    args
}

fn print_usage() {
    println!("Usage: maki [--config-dir DIR] [--data-dir DIR] [--version]");
}
