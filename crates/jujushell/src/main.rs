use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use jujushell::api::{self, JujuParams, LxdParams, SvcParams, TERMSERVER_PORT};
use jujushell::config;
use jujushell::gc::Collector;
use jujushell::juju::ControllerAuthenticator;
use jujushell::lxd::UnixConnector;
use jujushell::metrics::Metrics;
use jujushell::store::InMemory;

/// The Juju shell server.
#[derive(Debug, Parser)]
#[command(name = "jujushell", version, about = "Juju shell server")]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(std::io::stderr(), "{err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let conf = config::read(&cli.config).context("cannot read configuration file")?;
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(conf.log_level.to_filter())
        .try_init()
        .ok();
    serve(conf)
}

#[tokio::main]
async fn serve(conf: config::Config) -> Result<()> {
    info!(
        "starting the server on port {} with log level {:?}",
        conf.port, conf.log_level
    );

    let connector = Arc::new(UnixConnector::new(conf.lxd_socket.clone()));
    let store = Arc::new(InMemory::new());
    let metrics = Metrics::new().context("cannot create metrics")?;

    let router = api::build_router(
        JujuParams {
            addrs: conf.juju_addrs.clone(),
            cert: conf.juju_cert.clone(),
        },
        LxdParams {
            image_name: conf.image_name.clone(),
            profiles: conf.profiles.clone(),
        },
        SvcParams {
            allowed_users: conf.allowed_users.clone(),
            session_duration: Duration::from_secs(conf.session_timeout * 60),
            welcome_message: conf.welcome_message.clone(),
            term_port: TERMSERVER_PORT,
        },
        Arc::new(ControllerAuthenticator),
        connector.clone(),
        Arc::clone(&store),
        metrics,
    )
    .await
    .context("cannot create the server")?;

    let collector = Arc::new(Collector::new(
        connector,
        store,
        conf.gc_cap,
        conf.gc_days,
    ));
    if collector.enabled() {
        collector.spawn_interval();
    }

    let listener = TcpListener::bind(("0.0.0.0", conf.port))
        .await
        .with_context(|| format!("cannot listen on port {}", conf.port))?;
    info!("listening on {}", listener.local_addr()?);
    // TLS (including the Let's Encrypt dns-name flow) terminates in front
    // of this server; configuration keys are validated for the deployment
    // tooling but the listener itself speaks plain HTTP.
    axum::serve(listener, router)
        .await
        .context("server failed")?;
    Ok(())
}
