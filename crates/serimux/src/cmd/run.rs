use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serimux_engine::Multiplexer;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, RunArgs};
use crate::exit::{mux_error, CliResult, SUCCESS};

pub fn run(args: RunArgs) -> CliResult<i32> {
    let config = args.to_config()?;
    let mut mux = Multiplexer::open(&config).map_err(|err| mux_error("startup failed", err))?;

    info!(
        transport = %config.transport.display(),
        socket = %mux.socket_path().display(),
        "serving clients"
    );
    let outcome = match config.poll_interval {
        Some(interval) => {
            let running = Arc::new(AtomicBool::new(true));
            install_ctrlc_handler(running.clone())?;
            mux.run_while(&running, interval)
        }
        None => mux.run(),
    };
    outcome.map_err(|err| mux_error("multiplexer stopped", err))?;

    info!("interrupted; shutting down");
    Ok(SUCCESS)
}
