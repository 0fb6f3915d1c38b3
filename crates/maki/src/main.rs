mod cli;
mod debug_logging;

use maki::instance::Instance;

use std::process::exit;

#[macro_use]
extern crate log;

const DEBUG_LOG_FILE: &str = "maki_debug_logs.txt";

fn main() {
    let cli::Args {
        config_dir,
        data_dir,
        version,
    } = cli::parse();

    if version {
        println!("maki {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let debug_log_file = match data_dir.as_ref() {
        Some(data_dir) => data_dir.join(DEBUG_LOG_FILE),
        None => DEBUG_LOG_FILE.into(),
    };
    debug_logging::init(debug_log_file);

    // One task per server for the protocol work, one for its event pump,
    // plus this root task
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let instance = match Instance::new(config_dir, data_dir) {
            Ok(instance) => instance,
            Err(err) => {
                println!("Can't set up the instance directories: {}", err);
                exit(1);
            }
        };

        instance.load_servers();

        // The front-end transports (session bus, TCP) attach here; until
        // one does, signals only go to the debug log.
        let mut signals = instance.subscribe();

        loop {
            tokio::select! {
                ctrl_c = tokio::signal::ctrl_c() => {
                    if ctrl_c.is_err() {
                        error!("can't listen for SIGINT; shutting down");
                    }
                    instance.shutdown("maki: shutting down");
                    break;
                }
                signal = signals.recv() => {
                    match signal {
                        None => break,
                        Some(signal) => debug!("signal: {:?}", signal),
                    }
                }
            }
        }
    });

    // Let the server tasks deliver their QUITs and finish
    runtime.block_on(local);
}
