mod clock;
mod config;
mod error;
mod landing;
mod naming;
mod partition;
mod srv;

use std::process;

use clap::Parser;
use env_logger::Env;

use config::{Args, Config};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match Config::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    };

    let srv = match config.make_server() {
        Ok(srv) => srv,
        Err(e) => {
            log::error!("{}", e);
            process::exit(1);
        }
    };

    let shutdown = srv.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Signal received, exiting.");
        shutdown.shutdown();
    }) {
        log::error!("Unable to install signal handler: {}", e);
        process::exit(1);
    }

    srv.run();
}
