pub mod usb;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{commands, Config, RestartConfig};
use crate::retry::{Backoff, FailureWindow};
use crate::sleep_or_shutdown;

/// rtl_tcp prints this once its socket accepts clients
const TUNER_READY_MARKER: &str = "listening";
const LINE_CHANNEL_SIZE: usize = 100;
const TICKLE_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_REASON_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Unable to start {name}: {source}")]
    Spawn { name: String, source: std::io::Error },
    #[error("{0} has no stdout pipe")]
    NoStdout(String),
    #[error("{name} exited during startup ({reason})")]
    Exited { name: String, reason: String },
    #[error("Giving up after {failures} failures within {window_secs}s, last one: {last}")]
    CrashLoop { failures: u32, window_secs: u64, last: String },
    #[error("Shutdown requested")]
    Shutdown,
}

/// Command line of one external process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(name: &str, program: &str, args: Vec<String>) -> Self {
        return ProcessSpec {
            name: name.to_string(),
            program: program.to_string(),
            args,
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        return line;
    }
}

/// A running subprocess
pub struct ProcessHandle {
    name: String,
    child: Child,
    started: Instant,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn pid(&self) -> Option<u32> {
        return self.child.id();
    }

    pub fn is_alive(&mut self) -> bool {
        return self.exit_status().is_none();
    }

    /// `Some(reason)` once the process is gone
    pub fn exit_status(&mut self) -> Option<String> {
        return match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(format!("{status} after {}s", self.started.elapsed().as_secs())),
            Err(e) => Some(format!("unable to query state: {e}")),
        };
    }
}

/// Spawns the process with piped output. The child is killed if the handle is dropped.
pub fn start(spec: &ProcessSpec) -> Result<ProcessHandle, SupervisorError> {
    info!("[{}] starting: {}", spec.name, spec.command_line());

    let child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SupervisorError::Spawn { name: spec.name.clone(), source: e })?;

    debug!("[{}] running with pid {:?}", spec.name, child.id());
    return Ok(ProcessHandle {
        name: spec.name.clone(),
        child,
        started: Instant::now(),
    });
}

fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    return Ok(());
}

/// SIGTERM, wait up to `timeout`, then SIGKILL
pub async fn stop(mut handle: ProcessHandle, timeout: Duration) {
    if let Some(reason) = handle.exit_status() {
        debug!("[{}] already exited ({reason})", handle.name);
        return;
    }

    if let Some(pid) = handle.pid() {
        if let Err(e) = send_sigterm(pid) {
            warn!("[{}] unable to send SIGTERM: {e}", handle.name);
        }
    }

    match tokio::time::timeout(timeout, handle.child.wait()).await {
        Ok(Ok(status)) => info!("[{}] stopped ({status})", handle.name),
        Ok(Err(e)) => warn!("[{}] error waiting for exit: {e}", handle.name),
        Err(_) => {
            warn!("[{}] did not exit within {}s, killing it", handle.name, timeout.as_secs());
            if let Err(e) = handle.child.kill().await {
                error!("[{}] unable to kill: {e}", handle.name);
            }
        }
    }
}

/// Sends every non empty line of `reader` to `tx` until EOF or the receiver is gone
fn forward_lines<R>(name: String, reader: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    return tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).await.is_err() {
                        debug!("[{name}] line receiver gone");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("[{name}] end of output");
                    break;
                }
                Err(e) => {
                    warn!("[{name}] failed to read output: {e}");
                    break;
                }
            }
        }
    });
}

/// Logs the output of a process, optionally waking `ready` on the first line containing `marker`
fn forward_to_log<R>(name: String, reader: R, ready: Option<(Arc<Notify>, &'static str)>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    return tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut ready = ready;
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            debug!("[{name}] {line}");
            let is_ready = match &ready {
                Some((_, marker)) => line.contains(*marker),
                None => false,
            };
            if is_ready {
                if let Some((notify, _)) = ready.take() {
                    notify.notify_one();
                }
            }
        }
    });
}

/// Best effort connect and disconnect to wake a cold rtl_tcp
pub async fn tickle(host: &str, port: u16) {
    let host = if host == "0.0.0.0" { "127.0.0.1" } else { host };
    match tokio::time::timeout(TICKLE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            debug!("Tickled rtl_tcp at {host}:{port}");
        }
        Ok(Err(e)) => warn!("Tickling rtl_tcp at {host}:{port} failed: {e}"),
        Err(_) => warn!("Tickling rtl_tcp at {host}:{port} timed out"),
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub usb_reset: Option<String>,
    pub tickle: bool,
    pub tuner_host: String,
    pub tuner_port: u16,
    pub tuner_ready_timeout: Duration,
    pub stop_timeout: Duration,
}

/// Owns the tuner (rtl_tcp) and decoder (rtlamr) processes
pub struct ProcessSupervisor {
    tuner_spec: Option<ProcessSpec>,
    decoder_spec: ProcessSpec,
    options: SupervisorOptions,
    tuner: Option<ProcessHandle>,
    decoder: Option<ProcessHandle>,
    backoff: Backoff,
    failures: FailureWindow,
    failure_window: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ProcessSupervisor {
    pub fn new(config: &Config, listen_all: bool, shutdown: watch::Receiver<bool>) -> Self {
        let (tuner_host, tuner_port) = config.general.rtltcp_address().unwrap_or(("127.0.0.1".to_string(), 1234));
        let options = SupervisorOptions {
            usb_reset: config.general.usb_reset.clone(),
            tickle: config.general.tickle_rtl_tcp,
            tuner_host,
            tuner_port,
            tuner_ready_timeout: Duration::from_secs(config.general.tuner_ready_timeout),
            stop_timeout: config.restart.stop_timeout(),
        };

        return Self::with_specs(commands::rtltcp_spec(config),
                                commands::rtlamr_spec(config, listen_all),
                                options,
                                &config.restart,
                                shutdown);
    }

    pub fn with_specs(tuner_spec: Option<ProcessSpec>, decoder_spec: ProcessSpec, options: SupervisorOptions,
                      restart: &RestartConfig, shutdown: watch::Receiver<bool>) -> Self {
        if tuner_spec.is_none() {
            info!("Using remote rtl_tcp at {}:{}", options.tuner_host, options.tuner_port);
        }

        return ProcessSupervisor {
            tuner_spec,
            decoder_spec,
            options,
            tuner: None,
            decoder: None,
            backoff: Backoff::new(restart.initial_delay(), restart.max_delay(), 2.0),
            failures: FailureWindow::new(restart.max_failures, restart.failure_window()),
            failure_window: restart.failure_window(),
            shutdown,
        }
    }

    /// Starts both processes, retrying with backoff until they run or the
    /// failure ceiling is reached. Returns the decoder's output lines.
    pub async fn launch(&mut self) -> Result<mpsc::Receiver<String>, SupervisorError> {
        return match self.start_all().await {
            Ok(lines) => Ok(lines),
            Err(e) => {
                error!("Starting processes failed: {e}");
                self.restart(&e.to_string()).await
            }
        };
    }

    async fn start_all(&mut self) -> Result<mpsc::Receiver<String>, SupervisorError> {
        /* The tuner socket takes a single client, never run two decoders */
        if let Some(decoder) = self.decoder.take() {
            stop(decoder, self.options.stop_timeout).await;
        }

        if let Some(spec) = self.tuner_spec.clone() {
            if self.tuner.as_mut().map(|t| t.is_alive()).unwrap_or(false) {
                debug!("[{}] still running, not starting another one", spec.name);
            } else {
                self.start_tuner(&spec).await?;
            }
        }

        if self.options.tickle {
            tickle(&self.options.tuner_host, self.options.tuner_port).await;
        }

        let mut decoder = start(&self.decoder_spec)?;
        let stdout = decoder.child.stdout.take()
            .ok_or_else(|| SupervisorError::NoStdout(self.decoder_spec.name.clone()))?;
        if let Some(stderr) = decoder.child.stderr.take() {
            forward_to_log(format!("{} stderr", decoder.name), stderr, None);
        }

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_SIZE);
        forward_lines(decoder.name.clone(), stdout, tx);
        self.decoder = Some(decoder);

        return Ok(rx);
    }

    async fn start_tuner(&mut self, spec: &ProcessSpec) -> Result<(), SupervisorError> {
        if let Some(device) = &self.options.usb_reset {
            match usb::reset_device(device) {
                Ok(_) => info!("Reset USB device {device}"),
                Err(e) => warn!("Unable to reset USB device {device}: {e}"),
            }
        }

        let mut tuner = start(spec)?;
        let ready = Arc::new(Notify::new());
        if let Some(stdout) = tuner.child.stdout.take() {
            forward_to_log(spec.name.clone(), stdout, Some((ready.clone(), TUNER_READY_MARKER)));
        }
        if let Some(stderr) = tuner.child.stderr.take() {
            forward_to_log(spec.name.clone(), stderr, Some((ready.clone(), TUNER_READY_MARKER)));
        }

        let exited = tokio::select! {
            _ = ready.notified() => {
                info!("[{}] is listening", spec.name);
                None
            }
            status = tuner.child.wait() => match status {
                Ok(status) => Some(format!("{status}")),
                Err(e) => Some(format!("unable to query state: {e}")),
            },
            _ = tokio::time::sleep(self.options.tuner_ready_timeout) => {
                warn!("[{}] did not report readiness within {}s, continuing",
                      spec.name, self.options.tuner_ready_timeout.as_secs());
                None
            }
        };

        if let Some(reason) = exited.or_else(|| tuner.exit_status()) {
            return Err(SupervisorError::Exited { name: spec.name.clone(), reason });
        }

        self.tuner = Some(tuner);
        return Ok(());
    }

    /// Describes which process died, if any
    pub fn poll_exit(&mut self) -> Option<String> {
        for handle in [self.decoder.as_mut(), self.tuner.as_mut()].into_iter().flatten() {
            if let Some(reason) = handle.exit_status() {
                return Some(format!("{} exited ({reason})", handle.name));
            }
        }
        return None;
    }

    /// Called after the decoder output ended, gives the process a moment to be reaped
    pub async fn decoder_exit_reason(&mut self) -> String {
        let Some(decoder) = self.decoder.as_mut() else {
            return "decoder not running".to_string();
        };

        return match tokio::time::timeout(EXIT_REASON_TIMEOUT, decoder.child.wait()).await {
            Ok(Ok(status)) => format!("{} exited ({status})", decoder.name),
            Ok(Err(e)) => format!("{} output ended, wait failed: {e}", decoder.name),
            Err(_) => format!("{} closed its output", decoder.name),
        };
    }

    /// Stops everything, waits an increasing delay and starts again.
    /// Escalates to `CrashLoop` once too many failures happened within the window.
    pub async fn restart(&mut self, reason: &str) -> Result<mpsc::Receiver<String>, SupervisorError> {
        let mut reason = reason.to_string();
        loop {
            if self.failures.record(Instant::now()) {
                self.stop_all().await;
                return Err(SupervisorError::CrashLoop {
                    failures: self.failures.count(),
                    window_secs: self.failure_window.as_secs(),
                    last: reason,
                });
            }

            let delay = self.backoff.next_delay();
            warn!("{reason}, restarting in {:.1}s (failure {} of {} allowed per {}s)",
                  delay.as_secs_f64(), self.failures.count(), self.failures.max_failures(), self.failure_window.as_secs());

            self.stop_all().await;
            if sleep_or_shutdown(delay, &mut self.shutdown).await {
                return Err(SupervisorError::Shutdown);
            }

            match self.start_all().await {
                Ok(lines) => return Ok(lines),
                Err(e) => {
                    error!("Restart failed: {e}");
                    reason = e.to_string();
                }
            }
        }
    }

    /// A full cycle went through, forget earlier failures
    pub fn mark_healthy(&mut self) {
        if self.failures.count() > 0 {
            debug!("Processes healthy again, clearing {} recorded failures", self.failures.count());
        }
        self.backoff.reset();
        self.failures.clear();
    }

    /// Decoder first so it does not log a lost tuner connection
    pub async fn stop_all(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            stop(decoder, self.options.stop_timeout).await;
        }
        if let Some(tuner) = self.tuner.take() {
            stop(tuner, self.options.stop_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart_config(max_failures: u32) -> RestartConfig {
        RestartConfig {
            initial_delay: 1,
            max_delay: 2,
            max_failures,
            failure_window: 60,
            stop_timeout: 2,
        }
    }

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            usb_reset: None,
            tickle: false,
            tuner_host: "127.0.0.1".to_string(),
            tuner_port: 1,
            tuner_ready_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec::new("rtlamr", "/usr/bin/rtlamr", vec!["-format=json".to_string()]);
        assert_eq!(spec.command_line(), "/usr/bin/rtlamr -format=json");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut handle = start(&ProcessSpec::new("sleeper", "sleep", vec!["30".to_string()])).unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_some());
        stop(handle, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_exit_is_detected() {
        let mut handle = start(&sh("crasher", "exit 3")).unwrap();
        let _ = handle.child.wait().await;
        assert!(!handle.is_alive());
        assert!(handle.exit_status().unwrap().contains("3"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = start(&ProcessSpec::new("ghost", "/nonexistent/rtlamr", Vec::new()));
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_decoder_lines_are_streamed() {
        let (_tx, rx) = watch::channel(false);
        let decoder = sh("rtlamr", "printf 'first\\n\\nsecond\\n'");
        let mut supervisor = ProcessSupervisor::with_specs(None, decoder, options(), &restart_config(3), rx);

        let mut lines = supervisor.launch().await.unwrap();
        assert_eq!(lines.recv().await.as_deref(), Some("first"));
        assert_eq!(lines.recv().await.as_deref(), Some("second"));
        assert_eq!(lines.recv().await, None);

        let reason = supervisor.decoder_exit_reason().await;
        assert!(reason.contains("rtlamr"));
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_crash_loop_escalates() {
        let (_tx, rx) = watch::channel(false);
        let decoder = ProcessSpec::new("rtlamr", "/nonexistent/rtlamr", Vec::new());
        let mut supervisor = ProcessSupervisor::with_specs(None, decoder, options(), &restart_config(1), rx);

        let result = supervisor.launch().await;
        assert!(matches!(result, Err(SupervisorError::CrashLoop { failures: 1, .. })));
    }

    #[tokio::test]
    async fn test_restart_waits_and_restarts() {
        let (_tx, rx) = watch::channel(false);
        let decoder = sh("rtlamr", "echo again; sleep 30");
        let mut supervisor = ProcessSupervisor::with_specs(None, decoder, options(), &restart_config(3), rx);

        let started = Instant::now();
        let mut lines = supervisor.restart("rtlamr exited (exit status: 1)").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(lines.recv().await.as_deref(), Some("again"));
        assert!(supervisor.poll_exit().is_none());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_restart_interrupted_by_shutdown() {
        let (tx, rx) = watch::channel(false);
        let decoder = sh("rtlamr", "sleep 30");
        let mut supervisor = ProcessSupervisor::with_specs(None, decoder, options(), &restart_config(5), rx);
        tx.send(true).unwrap();

        let result = supervisor.restart("tuner exited").await;
        assert!(matches!(result, Err(SupervisorError::Shutdown)));
    }

    #[tokio::test]
    async fn test_dead_tuner_fails_without_waiting_for_readiness() {
        let (_tx, rx) = watch::channel(false);
        let tuner = sh("rtl_tcp", "echo 'usb_claim_interface error -6' >&2; exit 1");
        let decoder = sh("rtlamr", "sleep 30");
        let mut opts = options();
        opts.tuner_ready_timeout = Duration::from_secs(30);
        let mut supervisor = ProcessSupervisor::with_specs(Some(tuner), decoder, opts, &restart_config(1), rx);

        let started = Instant::now();
        let result = supervisor.launch().await;
        assert!(matches!(result, Err(SupervisorError::CrashLoop { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_failed_usb_reset_and_tickle_do_not_block_start() {
        let (_tx, rx) = watch::channel(false);
        let tuner = sh("rtl_tcp", "echo 'listening...'; sleep 30");
        let decoder = sh("rtlamr", "echo decoding; sleep 30");
        let mut opts = options();
        opts.usb_reset = Some("/dev/bus/usb/999/999".to_string());
        opts.tickle = true;
        opts.tuner_ready_timeout = Duration::from_secs(5);
        let mut supervisor = ProcessSupervisor::with_specs(Some(tuner), decoder, opts, &restart_config(1), rx);

        let mut lines = supervisor.launch().await.unwrap();
        assert_eq!(lines.recv().await.as_deref(), Some("decoding"));
        assert!(supervisor.poll_exit().is_none());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_tickle_closed_port_returns() {
        let started = Instant::now();
        tickle("127.0.0.1", 1).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_tuner_exit_during_startup() {
        let (_tx, rx) = watch::channel(false);
        let tuner = sh("rtl_tcp", "echo 'usb_claim_interface error -6'; exit 1");
        let decoder = sh("rtlamr", "sleep 30");
        let mut opts = options();
        opts.tuner_ready_timeout = Duration::from_millis(500);
        let mut supervisor = ProcessSupervisor::with_specs(Some(tuner), decoder, opts, &restart_config(1), rx);

        let result = supervisor.launch().await;
        assert!(matches!(result, Err(SupervisorError::CrashLoop { .. })));
    }
}
