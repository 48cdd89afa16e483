//! nethealth - network health probing harness
//!
//! Probes a set of peer nodes on two cadences for a fixed duration, raises
//! threshold alerts, and writes a summary when the run ends.

mod alert;
mod clock;
mod config;
mod probe;
mod report;
mod results;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::{Args, RunConfig};
use probe::CommandRunner;
use scheduler::{RouteAddress, SelfAddress, StaticAddress};
use session::{Outputs, Session, SessionError};

use std::sync::Arc;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() -> Result<(), ParseError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("nethealth=info".parse()?))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing() {
        eprintln!("cannot initialize logging: {}", e);
        std::process::exit(exitcode::SOFTWARE);
    }

    let code = match run(Args::parse()).await {
        Ok(()) => exitcode::OK,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<(), SessionError> {
    let config = RunConfig::from_args(args)?;

    if config.check_capabilities {
        session::verify_capabilities(&probe::check_capabilities())?;
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let outputs = Outputs::in_dir(&config.log_dir, &stamp)?;

    let resolver: Arc<dyn SelfAddress> = match &config.self_address {
        Some(addr) => Arc::new(StaticAddress(addr.clone())),
        None => Arc::new(RouteAddress::new(&config.targets)),
    };
    match resolver.resolve() {
        Some(addr) => tracing::info!("Local address is {}", addr),
        None => tracing::warn!("Could not determine local address, no target will be skipped"),
    }

    let session = Session::new(config, Arc::new(CommandRunner::new()), resolver)?;
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = session.run(outputs, interrupt).await?;
    tracing::info!(
        "Run finished after {}s: {} probes, {} failed, {} alerts",
        outcome.metadata.elapsed_secs(),
        outcome.snapshot.total_probes,
        outcome.snapshot.failed_probes,
        outcome.snapshot.total_alerts()
    );
    println!("{}", outcome.report);
    Ok(())
}
