use std::{env, io::Error, net::Ipv4Addr, process::exit, rc::Rc, sync::Arc};

use tokio::{net::TcpListener, task::LocalSet};
use tracing::{error, info};

use crate::{
    args::ArgumentsRequest,
    config::{Config, Role},
    metrics::Metrics,
    supervisor::Supervisor,
};

mod args;
mod codec;
mod config;
mod forward;
mod handshake;
mod logging;
mod metrics;
mod mux;
mod status;
mod supervisor;
mod throttle;
mod transport;
mod utils;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'natbridge --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    let config = match config::resolve(startup_args.mode, startup_args.overrides) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    };

    logging::init(&config);

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(config)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Finished with error: {error}");
        exit(1);
    }
}

async fn async_main(config: Config) -> Result<(), Error> {
    info!(
        "Starting {} for bridge {:?}, protocol {}",
        config.role, config.bridge_id, config.protocol
    );

    if config.role == Role::Exposer && config.protocol.includes_tcp() {
        supervisor::probe_exposed_service(&config).await?;
        info!("Exposed service is reachable on port {}", config.exposed_port);
    }

    let config = Rc::new(config);
    let metrics = Arc::new(Metrics::new());

    if config.status_port != 0 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.status_port)).await?;
        info!("Status endpoint on http://127.0.0.1:{}/status", config.status_port);
        tokio::task::spawn_local(status::serve(listener, Rc::clone(&config), Arc::clone(&metrics)));
    }

    let overlay = transport::quic::spawn(&config);

    let supervisor = Rc::new(Supervisor::new(Rc::clone(&config), metrics));
    supervisor.run(overlay).await
}
