use clap::Parser;
use log::{error, info, LevelFilter};
use rtlamr2mqtt::{Config, EnvOverrides, Orchestrator};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "rtlamr2mqtt", version, about = "Publish rtlamr utility meter readings to MQTT")]
struct Args {
    /// Config file (.yaml or .json), searched in the default locations when omitted
    #[arg(short, long, env = "RTLAMR2MQTT_CONFIG")]
    config: Option<PathBuf>,

    /// Log every decoded transmission instead of publishing
    #[arg(long)]
    listen_only: bool,
}

fn level_from_verbosity(verbosity: &str) -> LevelFilter {
    return match verbosity.trim().to_lowercase().as_str() {
        "warning" => LevelFilter::Warn,
        "none" => LevelFilter::Off,
        other => LevelFilter::from_str(other).unwrap_or(LevelFilter::Info),
    };
}

/// Flips the shutdown flag on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: watch::Sender<bool>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => info!("SIGINT received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                let _ = ctrl_c.await;
                info!("SIGINT received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("SIGINT received");
    }

    let _ = shutdown.send(true);
    shutdown.closed().await;
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    /* The env filter lets everything through, the max level is adjusted once the config is known */
    let log_override = std::env::var("RTLAMR2MQTT_LOG_LEVEL").ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("trace"));
    log::set_max_level(log_override.as_deref().map(level_from_verbosity).unwrap_or(LevelFilter::Info));

    let mut env = EnvOverrides::from_env();
    env.listen_only |= args.listen_only;

    let config = match Config::load(args.config.as_deref(), &env) {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if log_override.is_none() {
        log::set_max_level(level_from_verbosity(&config.general.verbosity));
    }

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("TLS crypto provider already installed");
    }

    info!("rtlamr2mqtt {} starting", env!("CARGO_PKG_VERSION"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_signal(shutdown_tx));

    match Orchestrator::new(config, shutdown_rx).run().await {
        Ok(()) => info!("Stopped"),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
