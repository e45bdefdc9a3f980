//! Reads utility meter broadcasts through rtl_tcp and rtlamr and publishes
//! one reading per meter and cycle to an MQTT broker, optionally with Home
//! Assistant discovery.

pub mod config;
pub mod models;
pub mod mqtt;
pub mod metering_rtlamr;
pub mod supervisor;
pub mod retry;
pub mod orchestrator;

use std::time::Duration;
use tokio::sync::watch;

pub use config::{Config, ConfigError, EnvOverrides, MeterConfig};
pub use models::{MeterProtocol, PublishedReading, RawReading};
pub use mqtt::{MqttPublisher, PublishError, ReadingPublisher};
pub use orchestrator::{Orchestrator, RunError};
pub use supervisor::{ProcessSupervisor, SupervisorError};

/// Sleeps for `duration` unless shutdown is requested first.
/// Returns true on shutdown. A dropped sender counts as shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
