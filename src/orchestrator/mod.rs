use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use std::time::Duration;

use crate::config::Config;
use crate::metering_rtlamr::{prepare_readings, CycleCoordinator, LineParser};
use crate::models::PublishedReading;
use crate::mqtt::{DiscoveryTracker, MqttPublisher, PublishError, ReadingPublisher};
use crate::sleep_or_shutdown;
use crate::supervisor::{ProcessSupervisor, SupervisorError};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// How collecting one cycle ended
#[derive(Debug, PartialEq)]
enum CycleEnd {
    Complete,
    TimedOut,
    Shutdown,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Publishes discovery (when `discovery` is given, once per meter) and state
/// for every reading. Transient broker problems drop the affected message,
/// fatal ones end the run.
pub async fn publish_cycle<P: ReadingPublisher>(publisher: &mut P, readings: &[PublishedReading],
                                                mut discovery: Option<&mut DiscoveryTracker>) -> Result<usize, PublishError> {
    let mut published = 0;
    for reading in readings {
        if let Some(tracker) = discovery.as_deref_mut() {
            if !tracker.is_sent(&reading.meter_id) {
                match publisher.publish_discovery(&reading.config).await {
                    Ok(()) => tracker.mark_sent(&reading.meter_id),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!("Discovery for meter {} not sent, retrying next cycle: {e}", reading.meter_id),
                }
            }
        }

        match publisher.publish_state(reading).await {
            Ok(()) => {
                info!("Meter {} ({}): {}", reading.meter_id, reading.config.name, reading.formatted_value);
                published += 1;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Dropping reading {} of meter {}: {e}", reading.formatted_value, reading.meter_id),
        }
    }
    return Ok(published);
}

/// Ties the processes, the decoder output and the publisher together
pub struct Orchestrator {
    config: Config,
    shutdown: watch::Receiver<bool>,
    discovery: DiscoveryTracker,
}

impl Orchestrator {
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> Self {
        return Orchestrator { config, shutdown, discovery: DiscoveryTracker::new() };
    }

    /// Runs until shutdown is requested or an unrecoverable error happens
    pub async fn run(mut self) -> Result<(), RunError> {
        if self.config.is_listen_only() {
            return self.run_listen_only().await;
        }

        let mut publisher = MqttPublisher::connect(&self.config.mqtt)?;
        let mut supervisor = ProcessSupervisor::new(&self.config, false, self.shutdown.clone());

        let result = self.run_cycles(&mut supervisor, &mut publisher).await;

        info!("Shutting down");
        supervisor.stop_all().await;
        publisher.disconnect().await;

        return match result {
            Err(RunError::Supervisor(SupervisorError::Shutdown)) => Ok(()),
            other => other,
        };
    }

    async fn run_listen_only(&mut self) -> Result<(), RunError> {
        warn!("Listen only mode: every decoded transmission is logged, nothing is published");
        let mut supervisor = ProcessSupervisor::new(&self.config, true, self.shutdown.clone());
        let result = self.listen(&mut supervisor).await;
        supervisor.stop_all().await;

        return match result {
            Err(RunError::Supervisor(SupervisorError::Shutdown)) => Ok(()),
            other => other,
        };
    }

    async fn listen(&mut self, supervisor: &mut ProcessSupervisor) -> Result<(), RunError> {
        let parser = LineParser::listen_all();
        let mut lines = supervisor.launch().await?;
        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
                line = lines.recv() => match line {
                    Some(line) => {
                        if let Some(reading) = parser.parse(&line) {
                            info!("{reading}");
                            supervisor.mark_healthy();
                        }
                    }
                    None => {
                        let reason = supervisor.decoder_exit_reason().await;
                        lines = supervisor.restart(&reason).await?;
                    }
                },
                _ = health.tick() => {
                    if let Some(reason) = supervisor.poll_exit() {
                        lines = supervisor.restart(&reason).await?;
                    }
                }
            }
        }
    }

    /// The collect, publish and optionally sleep loop
    pub async fn run_cycles<P: ReadingPublisher>(&mut self, supervisor: &mut ProcessSupervisor, publisher: &mut P) -> Result<(), RunError> {
        let meters = self.config.meters.clone();
        let parser = LineParser::new(&meters);
        let mut cycle = CycleCoordinator::new(meters.iter().map(|m| m.id.clone()));
        info!("Watching {} meter(s): {}", meters.len(),
              meters.iter().map(|m| format!("{} ({})", m.id, m.protocol.to_string())).collect::<Vec<_>>().join(", "));

        let mut lines = supervisor.launch().await?;

        loop {
            let end = self.collect_cycle(supervisor, &parser, &mut cycle, &mut lines).await?;
            let number = cycle.cycle();
            match end {
                CycleEnd::Shutdown => return Ok(()),
                CycleEnd::Complete => debug!("Cycle {number} complete"),
                CycleEnd::TimedOut => warn!("Cycle {number} timed out, no reading from: {}", cycle.pending().join(", ")),
            }

            let latest = cycle.start_next_cycle();
            let readings = prepare_readings(&latest, &meters);
            let discovery = if self.config.mqtt.ha_autodiscovery { Some(&mut self.discovery) } else { None };
            let published = publish_cycle(publisher, &readings, discovery).await?;
            info!("Cycle {number}: published {published} of {} reading(s)", readings.len());

            if end == CycleEnd::Complete {
                supervisor.mark_healthy();
            }

            if let Some(pause) = self.config.general.sleep_for() {
                info!("Sleeping for {}s", pause.as_secs());
                supervisor.stop_all().await;
                if sleep_or_shutdown(pause, &mut self.shutdown).await {
                    return Ok(());
                }
                lines = supervisor.launch().await?;
            }
        }
    }

    async fn collect_cycle(&mut self, supervisor: &mut ProcessSupervisor, parser: &LineParser,
                           cycle: &mut CycleCoordinator, lines: &mut mpsc::Receiver<String>) -> Result<CycleEnd, RunError> {
        let deadline = self.config.general.cycle_timeout().map(|t| Instant::now() + t);
        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *self.shutdown.borrow() {
                return Ok(CycleEnd::Shutdown);
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(CycleEnd::Shutdown);
                    }
                }
                line = lines.recv() => match line {
                    Some(line) => {
                        let Some(reading) = parser.parse(&line) else {
                            continue;
                        };
                        debug!("Received {reading}");
                        cycle.record(reading);
                        if cycle.is_complete() {
                            return Ok(CycleEnd::Complete);
                        }
                    }
                    None => {
                        let reason = supervisor.decoder_exit_reason().await;
                        error!("Decoder output ended: {reason}");
                        *lines = supervisor.restart(&reason).await?;
                    }
                },
                _ = health.tick() => {
                    if let Some(reason) = supervisor.poll_exit() {
                        *lines = supervisor.restart(&reason).await?;
                    }
                }
                _ = wait_deadline(deadline) => {
                    return Ok(CycleEnd::TimedOut);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MeterConfig, RestartConfig};
    use crate::models::MeterProtocol;
    use crate::supervisor::{ProcessSpec, SupervisorOptions};

    /// Records what would have been sent and requests shutdown after `stop_after` states
    struct RecordingPublisher {
        discoveries: Vec<String>,
        states: Vec<(String, String)>,
        fail_first_state: Option<PublishError>,
        fail_first_discovery: Option<PublishError>,
        stop_after: usize,
        shutdown: watch::Sender<bool>,
    }

    impl RecordingPublisher {
        fn new(stop_after: usize, shutdown: watch::Sender<bool>) -> Self {
            RecordingPublisher {
                discoveries: Vec::new(),
                states: Vec::new(),
                fail_first_state: None,
                fail_first_discovery: None,
                stop_after,
                shutdown,
            }
        }
    }

    impl ReadingPublisher for RecordingPublisher {
        async fn publish_discovery(&mut self, meter: &MeterConfig) -> Result<(), PublishError> {
            if let Some(e) = self.fail_first_discovery.take() {
                return Err(e);
            }
            self.discoveries.push(meter.id.clone());
            return Ok(());
        }

        async fn publish_state(&mut self, reading: &PublishedReading) -> Result<(), PublishError> {
            if let Some(e) = self.fail_first_state.take() {
                return Err(e);
            }
            self.states.push((reading.meter_id.clone(), reading.formatted_value.clone()));
            if self.states.len() >= self.stop_after {
                let _ = self.shutdown.send(true);
            }
            return Ok(());
        }
    }

    fn meter(id: &str, format: Option<&str>) -> MeterConfig {
        MeterConfig {
            id: id.to_string(),
            protocol: MeterProtocol::Scm,
            name: format!("meter {id}"),
            format: format.map(|f| f.to_string()),
            unit_of_measurement: None,
            icon: None,
            device_class: None,
            state_class: None,
        }
    }

    fn scm(id: u64, consumption: u64) -> String {
        format!(r#"{{"Type":"SCM","Message":{{"ID":{id},"Consumption":{consumption}}}}}"#)
    }

    fn decoder_printing(lines: &[String]) -> ProcessSpec {
        let quoted: Vec<String> = lines.iter().map(|l| format!("'{l}'")).collect();
        let script = format!("printf '%s\\n' {}; sleep 30", quoted.join(" "));
        ProcessSpec::new("rtlamr", "/bin/sh", vec!["-c".to_string(), script])
    }

    fn supervisor(decoder: ProcessSpec, shutdown: watch::Receiver<bool>) -> ProcessSupervisor {
        let options = SupervisorOptions {
            usb_reset: None,
            tickle: false,
            tuner_host: "127.0.0.1".to_string(),
            tuner_port: 1,
            tuner_ready_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        };
        let restart = RestartConfig {
            initial_delay: 1,
            max_delay: 1,
            max_failures: 3,
            failure_window: 60,
            stop_timeout: 2,
        };
        ProcessSupervisor::with_specs(None, decoder, options, &restart, shutdown)
    }

    fn config(meters: Vec<MeterConfig>) -> Config {
        let mut config = Config::defaults();
        config.meters = meters;
        config
    }

    #[tokio::test]
    async fn test_cycle_publishes_last_value_once_per_meter() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1), scm(9999, 7), scm(1001, 2), scm(2002, 12345), scm(1001, 9)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(2, tx);
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None), meter("2002", Some("###.##"))]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states, vec![
            ("1001".to_string(), "2".to_string()),
            ("2002".to_string(), "123.45".to_string()),
        ]);
        assert_eq!(publisher.discoveries, vec!["1001".to_string(), "2002".to_string()]);
    }

    #[tokio::test]
    async fn test_discovery_sent_once_across_cycles() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1), scm(1001, 2), scm(1001, 3)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(3, tx);
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None)]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states.len(), 3);
        assert_eq!(publisher.discoveries, vec!["1001".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_discovery_is_retried_next_cycle() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1), scm(1001, 2), scm(1001, 3)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(3, tx);
        publisher.fail_first_discovery = Some(PublishError::NotConnected);
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None)]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states.len(), 3);
        assert_eq!(publisher.discoveries, vec!["1001".to_string()]);
    }

    #[tokio::test]
    async fn test_no_discovery_when_disabled() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(1, tx);
        let mut cfg = config(vec![meter("1001", None)]);
        cfg.mqtt.ha_autodiscovery = false;
        let mut orchestrator = Orchestrator::new(cfg, rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states, vec![("1001".to_string(), "1".to_string())]);
        assert!(publisher.discoveries.is_empty());
    }

    #[tokio::test]
    async fn test_transient_publish_error_drops_only_that_reading() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1), scm(1001, 2)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(1, tx);
        publisher.fail_first_state = Some(PublishError::NotConnected);
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None)]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states, vec![("1001".to_string(), "2".to_string())]);
    }

    #[tokio::test]
    async fn test_fatal_publish_error_ends_the_run() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 1)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(1, tx);
        publisher.fail_first_state = Some(PublishError::Tls("handshake failed".to_string()));
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None)]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Err(RunError::Publish(PublishError::Tls(_))))));
        assert!(publisher.states.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_timeout_publishes_partial_cycle() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 5)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(1, tx);
        let mut cfg = config(vec![meter("1001", None), meter("2002", None)]);
        cfg.general.cycle_timeout = 1;
        let mut orchestrator = Orchestrator::new(cfg, rx);

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(publisher.states, vec![("1001".to_string(), "5".to_string())]);
    }

    #[tokio::test]
    async fn test_shutdown_while_collecting() {
        let (tx, rx) = watch::channel(false);
        let decoder = decoder_printing(&[scm(1001, 5)]);
        let mut supervisor = supervisor(decoder, rx.clone());
        let mut publisher = RecordingPublisher::new(10, tx.clone());
        let mut orchestrator = Orchestrator::new(config(vec![meter("1001", None), meter("2002", None)]), rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tx.send(true);
        });

        let result = tokio::time::timeout(Duration::from_secs(10),
                                          orchestrator.run_cycles(&mut supervisor, &mut publisher)).await;
        supervisor.stop_all().await;

        assert!(matches!(result, Ok(Ok(()))));
        assert!(publisher.states.is_empty());
    }
}
