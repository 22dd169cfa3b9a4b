// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collection pipeline.
//!
//! An [`Agent`] runs one monitoring run: it validates the metrics, starts the run at the sink,
//! spawns or attaches to the target, negotiates the shared counters with the client and then
//! drives three tasks until the target is gone:
//!
//! - the sampler, producing one sample per interval,
//! - the command listener, forwarding client tags,
//! - the dispatcher, batching both into the sink.
//!
//! Whatever way the run ends, the target is terminated if it was spawned and is still alive,
//! the shared counters are removed and the control socket is unlinked.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::unix::OwnedReadHalf;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{negotiate, Collector, CollectorKind};
use crate::constants::{
    DEFAULT_ACCEPT_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_KILL_GRACE, DEFAULT_MEMORY_LIMIT_INTERVAL,
    DEFAULT_SEND_INTERVAL, DISPATCH_QUEUE_CAPACITY, LISTENER_DRAIN_TIMEOUT,
};
use crate::control::{ControlCommand, ControlListener, HandshakeReply, LineReader};
use crate::dispatcher::{DispatchHandle, Dispatcher};
use crate::errors::{AgentError, ConfigError, ProtocolError};
use crate::message::{Message, Run, Tag};
use crate::metric::{self, MetricDefinition, MetricSet};
use crate::proc::{ProcReader, PROC_PATH};
use crate::process::{MonitoredProcess, Target};
use crate::sampler::Sampler;
use crate::sink::{Sink, SinkConfig};

/// Lifecycle of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    /// Validating configuration, opening the sink and socket, starting the target.
    Initializing,
    /// Sampling, listening and dispatching.
    Running,
    /// The target is gone or a stop was requested; remaining items are flushed.
    Draining,
    Stopped,
    /// Ended by an error.
    Aborted,
}

/// Supervision of a spawned target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Wall clock runtime.
    pub time: Option<Duration>,
    /// Resident memory of the whole process tree, in MB.
    pub memory_mb: Option<u64>,
    pub memory_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            time: None,
            memory_mb: None,
            memory_interval: DEFAULT_MEMORY_LIMIT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Run name, defaults to the program path or the PID.
    pub name: String,
    pub sub_name: String,
    pub interval: Duration,
    pub send_interval: Duration,
    pub target: Target,
    pub metrics: Vec<MetricDefinition>,
    pub sink: SinkConfig,
    /// Control socket. When set the agent waits for a client before sampling.
    pub socket: Option<PathBuf>,
    pub accept_timeout: Duration,
    pub limits: Limits,
    pub kill_grace: Duration,
    /// Collector protocols this agent offers, in no particular order.
    pub protocols: Vec<CollectorKind>,
    pub queue_capacity: usize,
    pub proc_root: PathBuf,
}

impl AgentConfig {
    pub fn new(target: Target, metrics: Vec<MetricDefinition>) -> Self {
        let name = match &target {
            Target::Spawn { program, .. } => program.clone(),
            Target::Attach { pid } => pid.to_string(),
        };

        Self {
            name,
            sub_name: String::new(),
            interval: DEFAULT_INTERVAL,
            send_interval: DEFAULT_SEND_INTERVAL,
            target,
            metrics,
            sink: SinkConfig::Csv,
            socket: None,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            limits: Limits::default(),
            kill_grace: DEFAULT_KILL_GRACE,
            protocols: CollectorKind::SUPPORTED.to_vec(),
            queue_capacity: DISPATCH_QUEUE_CAPACITY,
            proc_root: PathBuf::from(PROC_PATH),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let spawn = match &self.target {
            Target::Spawn { program, .. } => {
                if program.trim().is_empty() {
                    return Err(ConfigError::Invalid("No program to execute".to_string()));
                }
                true
            }
            Target::Attach { pid } => {
                if *pid <= 0 {
                    return Err(ConfigError::Invalid(format!(
                        "PID must be a positive number, got {pid}"
                    )));
                }
                false
            }
        };

        for (name, value) in [
            ("interval", self.interval),
            ("send interval", self.send_interval),
            ("memory limit interval", self.limits.memory_interval),
            ("accept timeout", self.accept_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "The {name} must be a positive duration"
                )));
            }
        }

        if !spawn && self.limits.time.is_some() {
            return Err(ConfigError::Invalid(
                "A time limit only works for a spawned program".to_string(),
            ));
        }
        if !spawn && self.limits.memory_mb.is_some() {
            return Err(ConfigError::Invalid(
                "A memory limit only works for a spawned program".to_string(),
            ));
        }
        if self.limits.time.is_some_and(|time| time.is_zero()) {
            return Err(ConfigError::Invalid(
                "The time limit must be a positive duration".to_string(),
            ));
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one collector protocol must be supported".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "The dispatch queue needs a capacity".to_string(),
            ));
        }
        if matches!(self.sink, SinkConfig::Remote { .. }) && self.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "A run name is needed for a remote sink".to_string(),
            ));
        }

        metric::validate(&self.metrics)?;
        Ok(())
    }
}

/// Observes and stops a running [`Agent`] from elsewhere.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    state: Arc<RwLock<AgentState>>,
    cancel: CancellationToken,
}

impl AgentHandle {
    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, AgentState::Running)
    }

    /// Requests a graceful stop: sampling ends, queued items are flushed and a spawned
    /// target is terminated.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn set_state(&self, state: AgentState) {
        debug!("Agent state {state:?}");
        *self.state.write().await = state;
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Option<i32>,
    pub pid: i32,
    pub samples: usize,
    pub tags: usize,
    /// Exit status of a spawned target.
    pub exit_status: Option<ExitStatus>,
    /// When the sink closed the run.
    pub stop_time: Option<SystemTime>,
}

pub struct Agent {
    config: AgentConfig,
    handle: AgentHandle,
    csv_writer: Option<Box<dyn Write + Send>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            handle: AgentHandle {
                state: Arc::new(RwLock::new(AgentState::Idle)),
                cancel: CancellationToken::new(),
            },
            csv_writer: None,
        }
    }

    /// Sends CSV rows to `writer` instead of stdout.
    pub fn with_csv_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.csv_writer = Some(writer);
        self
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) -> Result<RunSummary, AgentError> {
        self.handle.set_state(AgentState::Initializing).await;

        let result = self.run_inner().await;
        match &result {
            Ok(summary) => {
                info!(
                    "Run finished with {} samples and {} tags",
                    summary.samples, summary.tags
                );
                self.handle.set_state(AgentState::Stopped).await;
            }
            Err(e) => {
                error!("Run aborted: {e}");
                self.handle.set_state(AgentState::Aborted).await;
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<RunSummary, AgentError> {
        self.config.validate()?;
        let config = self.config.clone();

        let metrics = Arc::new(MetricSet::new(&config.metrics).map_err(ConfigError::from)?);
        debug!(
            "{} metrics, {} internal, {} external",
            metrics.len(),
            metrics.internal_count(),
            metrics.external().len()
        );
        let reader = ProcReader::new(&config.proc_root);

        let mut sink = match self.csv_writer.take() {
            Some(writer) => config.sink.open_with_writer(writer)?,
            None => config.sink.open()?,
        };
        let (prog, prog_args) = match &config.target {
            Target::Spawn { program, args } => (program.clone(), args.clone()),
            Target::Attach { .. } => (String::new(), Vec::new()),
        };
        let mut run = Run::new(
            &config.name,
            &config.sub_name,
            config.interval,
            metrics.specs().to_vec(),
            &prog,
            prog_args,
        );
        sink.start_run(&mut run).await?;

        // The dispatcher owns the started run and stops it once every handle is gone,
        // whichever way observing the target ends.
        let (dispatcher, dispatch) =
            Dispatcher::new(sink, run, config.send_interval, config.queue_capacity);
        let dispatching = tokio::spawn(dispatcher.run());

        let observed = observe(&config, &self.handle, metrics, reader, dispatch).await;
        let dispatched = dispatching.await.map_err(task_error)?;

        match (observed, dispatched) {
            (Ok(observed), Ok((run, stats))) => Ok(RunSummary {
                run_id: run.id,
                pid: observed.pid,
                samples: stats.samples,
                tags: stats.tags,
                exit_status: observed.exit_status,
                stop_time: run.stop_time,
            }),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), dispatched) => {
                if let Err(stop_error) = dispatched {
                    warn!("Run was not closed cleanly: {stop_error}");
                }
                Err(e)
            }
        }
    }
}

/// What is known about the target once it is gone.
struct Observed {
    pid: i32,
    exit_status: Option<ExitStatus>,
}

/// Binds the control socket, starts or attaches to the target and monitors it.
///
/// `dispatch` is dropped on every return, which lets the dispatcher close the run.
async fn observe(
    config: &AgentConfig,
    handle: &AgentHandle,
    metrics: Arc<MetricSet>,
    reader: ProcReader,
    dispatch: DispatchHandle,
) -> Result<Observed, AgentError> {
    let listener = config
        .socket
        .as_ref()
        .map(|path| {
            ControlListener::bind(path).map_err(|source| AgentError::Socket {
                path: path.clone(),
                source,
            })
        })
        .transpose()?;

    let mut process = match &config.target {
        Target::Spawn { program, args } => {
            MonitoredProcess::spawn(program, args, config.kill_grace)?
        }
        Target::Attach { pid } => MonitoredProcess::attach(*pid, &reader)?,
    };
    info!("Monitor program with PID {}", process.pid());

    // From here on the process has to be cleaned up on every path.
    let result = monitor(config, handle, &process, listener, metrics, reader, dispatch).await;

    if result.is_err() || handle.cancel.is_cancelled() {
        process.terminate().await;
    }
    let exit_status = process.close().await;

    result?;
    Ok(Observed {
        pid: process.pid(),
        exit_status,
    })
}

/// Handshake result: the producer side of the shared counters and the command stream.
type Attached = (Collector, LineReader<OwnedReadHalf>);

async fn monitor(
    config: &AgentConfig,
    handle: &AgentHandle,
    process: &MonitoredProcess,
    listener: Option<ControlListener>,
    metrics: Arc<MetricSet>,
    reader: ProcReader,
    dispatch: DispatchHandle,
) -> Result<(), AgentError> {
    let cancel = handle.cancel.clone();
    let exited = process.exited();
    let supervisors = CancellationToken::new();
    let _stop_supervisors = supervisors.clone().drop_guard();

    if let Some(limit) = config.limits.time {
        process.supervise_time(limit, supervisors.clone());
    }
    if let Some(limit_mb) = config.limits.memory_mb {
        process.supervise_memory(
            limit_mb,
            config.limits.memory_interval,
            reader.clone(),
            supervisors.clone(),
        );
    }

    let mut collector = None;
    let mut commands = None;
    if let Some(listener) = &listener {
        let count = metrics.internal_count();
        let attached = tokio::select! {
            attached = attach_client(config, listener, process.pid(), count) => attached?,
            _ = cancel.cancelled() => {
                info!("Stopped while waiting for a client");
                return Ok(());
            }
            _ = exited.cancelled() => {
                info!("Program exited while waiting for a client");
                return Ok(());
            }
        };
        let (producer, stream) = attached;
        collector = Some(Arc::new(producer));
        commands = Some(stream);
    }

    handle.set_state(AgentState::Running).await;

    let listen_cancel = CancellationToken::new();
    let listening = commands.map(|commands| {
        tokio::spawn(listen(commands, dispatch.clone(), listen_cancel.clone()))
    });

    let sampler = Sampler::new(
        process.pid(),
        metrics,
        reader,
        config.interval,
        collector.clone(),
    );
    let sampling = tokio::spawn(sampler.run(dispatch, exited, cancel));
    let samples = sampling.await.map_err(task_error)?;
    debug!("Sampler finished after {samples} samples");

    handle.set_state(AgentState::Draining).await;

    if let Some(mut listening) = listening {
        // give tags sent right before the exit a chance to arrive
        let tags = match tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, &mut listening).await {
            Ok(joined) => joined,
            Err(_) => {
                listen_cancel.cancel();
                listening.await
            }
        };
        debug!("Command listener forwarded {} tags", tags.map_err(task_error)?);
    }
    drop(listener);

    if let Some(collector) = collector {
        match Arc::try_unwrap(collector) {
            Ok(mut collector) => collector.close()?,
            Err(_) => warn!("Collector still in use, it is released once dropped"),
        }
    }

    Ok(())
}

/// Accepts the client and negotiates the shared counters.
///
/// Accepting and the handshake are each bounded by the accept timeout.
async fn attach_client(
    config: &AgentConfig,
    listener: &ControlListener,
    pid: i32,
    count: usize,
) -> Result<Attached, AgentError> {
    let mut connection = listener.accept(config.accept_timeout).await?;
    debug!("Client connected on {}", listener.path().display());

    let handshake = async {
        let hello = connection.read_hello().await?;
        let kind = negotiate(&hello.protocols, &config.protocols)?;
        let (producer, url) = Collector::init_as_producer(kind, pid, count)?;
        // the collector is dropped, and so removed, if the reply fails
        connection
            .send_reply(&HandshakeReply { count, url })
            .await?;
        Ok::<_, AgentError>(producer)
    };
    let producer = tokio::time::timeout(config.accept_timeout, handshake)
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout(config.accept_timeout))??;

    Ok((producer, connection.into_reader()))
}

fn task_error(e: tokio::task::JoinError) -> AgentError {
    AgentError::Task(e.to_string())
}

/// Forwards client commands until end of stream, a read error or `cancel`.
async fn listen(
    mut commands: LineReader<OwnedReadHalf>,
    dispatch: DispatchHandle,
    cancel: CancellationToken,
) -> usize {
    debug!("Start listening to commands");
    let mut tags = 0;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = commands.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match ControlCommand::decode(&line) {
                Some(ControlCommand::Tag(text)) => {
                    if dispatch.send(Message::Tag(Tag::new(&text))).await.is_err() {
                        break;
                    }
                    tags += 1;
                }
                None => warn!("Unknown command {:?}", line.chars().next()),
            },
            Ok(None) => {
                debug!("Unix socket got closed with EOF");
                break;
            }
            Err(e) => {
                error!("Reading commands failed: {e}");
                break;
            }
        }
    }

    debug!("Stop listening to commands after {tags} tags");
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sh(script: &str) -> Target {
        Target::Spawn {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn config(target: Target) -> AgentConfig {
        let mut config = AgentConfig::new(
            target,
            vec![MetricDefinition::new("proc.stat.utime", "int")],
        );
        config.interval = Duration::from_millis(10);
        config.send_interval = Duration::from_millis(50);
        config.kill_grace = Duration::from_millis(200);
        config
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::new(
            Target::Spawn {
                program: "/usr/bin/app".to_string(),
                args: vec![],
            },
            vec![MetricDefinition::new("a", "int")],
        );
        assert_eq!(config.name, "/usr/bin/app");
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.send_interval, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.protocols, vec![CollectorKind::Shm, CollectorKind::Mmap]);
        assert!(config.validate().is_ok());

        let attach = AgentConfig::new(Target::Attach { pid: 42 }, vec![]);
        assert_eq!(attach.name, "42");
    }

    #[test]
    fn test_validate_rejects() {
        let mut limited = config(Target::Attach { pid: 1 });
        limited.limits.time = Some(Duration::from_secs(1));
        assert!(matches!(limited.validate(), Err(ConfigError::Invalid(_))));

        let mut limited = config(Target::Attach { pid: 1 });
        limited.limits.memory_mb = Some(10);
        assert!(matches!(limited.validate(), Err(ConfigError::Invalid(_))));

        let mut zero = config(sh("true"));
        zero.interval = Duration::ZERO;
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let mut no_protocols = config(sh("true"));
        no_protocols.protocols.clear();
        assert!(no_protocols.validate().is_err());

        assert!(config(Target::Attach { pid: 0 }).validate().is_err());
        assert!(config(sh("")).validate().is_ok());
        assert!(config(Target::Spawn {
            program: " ".to_string(),
            args: vec![]
        })
        .validate()
        .is_err());

        let mut metrics = config(sh("true"));
        metrics.metrics.push(MetricDefinition::new("proc.stat.utime", "int"));
        assert!(matches!(
            metrics.validate(),
            Err(ConfigError::Validation(
                crate::errors::ValidationError::DuplicateName { index: 1, .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_run_without_client_writes_csv() {
        let buffer = SharedBuffer::default();
        let agent = Agent::new(config(sh("sleep 0.2"))).with_csv_writer(Box::new(buffer.clone()));
        let handle = agent.handle();
        assert_eq!(handle.state().await, AgentState::Idle);

        let summary = agent.run().await.unwrap();
        assert!(summary.samples >= 1);
        assert_eq!(summary.exit_status.and_then(|s| s.code()), Some(0));
        assert_eq!(handle.state().await, AgentState::Stopped);

        let csv = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("time;tag;proc.stat.utime"));
        assert_eq!(lines.count(), summary.samples);
    }

    #[tokio::test]
    async fn test_unknown_external_metric_aborts_before_start() {
        let mut config = config(sh("sleep 5"));
        config.metrics = vec![MetricDefinition::new("proc.stat.bogus", "int")];
        let agent = Agent::new(config);
        let handle = agent.handle();

        let result = agent.run().await;
        assert!(matches!(
            result,
            Err(AgentError::Config(ConfigError::Validation(
                crate::errors::ValidationError::UnknownExternalMetric { index: 0, .. }
            )))
        ));
        assert_eq!(handle.state().await, AgentState::Aborted);
    }

    #[tokio::test]
    async fn test_accept_timeout_terminates_target() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let mut config = config(sh("sleep 30"));
        config.socket = Some(socket.clone());
        config.accept_timeout = Duration::from_millis(50);

        let result = Agent::new(config)
            .with_csv_writer(Box::new(SharedBuffer::default()))
            .run()
            .await;
        assert!(matches!(
            result,
            Err(AgentError::Protocol(ProtocolError::AcceptTimeout(_)))
        ));
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let mut config = config(sh("sleep 30"));
        config.socket = Some(socket.clone());
        config.protocols = vec![CollectorKind::Shm];

        let client = tokio::spawn(async move {
            let mut stream = loop {
                match UnixStream::connect(&socket).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            };
            stream.write_all(b"tirion v0.1\tmmap\n").await.unwrap();
            stream
        });

        let result = Agent::new(config)
            .with_csv_writer(Box::new(SharedBuffer::default()))
            .run()
            .await;
        assert!(matches!(
            result,
            Err(AgentError::Protocol(ProtocolError::UnsupportedProtocol(p))) if p == "mmap"
        ));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_terminates_spawned_target() {
        let agent = Agent::new(config(sh("sleep 30")))
            .with_csv_writer(Box::new(SharedBuffer::default()));
        let handle = agent.handle();
        let running = tokio::spawn(agent.run());

        while !handle.is_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop();

        let summary = running.await.unwrap().unwrap();
        assert!(!summary.exit_status.unwrap().success());
        assert!(summary.stop_time.is_some());
        assert_eq!(handle.state().await, AgentState::Stopped);
    }

    /// Connects to `socket` once it exists and never says anything.
    fn silent_client(socket: PathBuf) -> tokio::task::JoinHandle<UnixStream> {
        tokio::spawn(async move {
            loop {
                match UnixStream::connect(&socket).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
    }

    #[tokio::test]
    async fn test_stop_during_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let mut config = config(sh("sleep 30"));
        config.socket = Some(socket.clone());

        let agent = Agent::new(config).with_csv_writer(Box::new(SharedBuffer::default()));
        let handle = agent.handle();
        let running = tokio::spawn(agent.run());

        let client = silent_client(socket.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        let summary = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("stop ends a pending handshake")
            .unwrap()
            .unwrap();
        assert_eq!(summary.samples, 0);
        assert!(!summary.exit_status.unwrap().success());
        assert_eq!(handle.state().await, AgentState::Stopped);
        assert!(!socket.exists());
        drop(client);
    }

    #[tokio::test]
    async fn test_exit_during_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let mut config = config(sh("sleep 0.3"));
        config.socket = Some(socket.clone());

        let running = tokio::spawn(
            Agent::new(config)
                .with_csv_writer(Box::new(SharedBuffer::default()))
                .run(),
        );
        let client = silent_client(socket).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("program exit ends a pending handshake")
            .unwrap()
            .unwrap();
        assert!(summary.exit_status.unwrap().success());
        drop(client);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let mut config = config(sh("sleep 30"));
        config.socket = Some(socket.clone());
        config.accept_timeout = Duration::from_millis(200);

        let running = tokio::spawn(
            Agent::new(config)
                .with_csv_writer(Box::new(SharedBuffer::default()))
                .run(),
        );
        let client = silent_client(socket).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(AgentError::Protocol(ProtocolError::HandshakeTimeout(_)))
        ));
        drop(client);
    }

    async fn remote_run(server: &mut mockito::ServerGuard) -> (mockito::Mock, mockito::Mock) {
        let start = server
            .mock("POST", "/program/p/run/start")
            .with_status(200)
            .with_body(r#"{"Run": 1, "Error": ""}"#)
            .create_async()
            .await;
        let stop = server
            .mock("GET", "/program/p/run/1/stop")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        (start, stop)
    }

    #[tokio::test]
    async fn test_remote_run_stopped_when_stopped_before_client() {
        let mut server = Server::new_async().await;
        let (start, stop) = remote_run(&mut server).await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = config(sh("sleep 30"));
        config.name = "p".to_string();
        config.sink = SinkConfig::from_server(Some(&server.url()));
        config.socket = Some(dir.path().join("agent.sock"));

        let agent = Agent::new(config);
        let handle = agent.handle();
        let running = tokio::spawn(agent.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();

        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.run_id, Some(1));
        assert!(summary.stop_time.is_some());
        start.assert_async().await;
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_remote_run_stopped_when_run_aborts() {
        let mut server = Server::new_async().await;
        let (start, stop) = remote_run(&mut server).await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = config(sh("sleep 30"));
        config.name = "p".to_string();
        config.sink = SinkConfig::from_server(Some(&server.url()));
        config.socket = Some(dir.path().join("agent.sock"));
        config.accept_timeout = Duration::from_millis(50);

        let agent = Agent::new(config);
        let handle = agent.handle();
        let result = agent.run().await;
        assert!(matches!(
            result,
            Err(AgentError::Protocol(ProtocolError::AcceptTimeout(_)))
        ));
        assert_eq!(handle.state().await, AgentState::Aborted);
        start.assert_async().await;
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_remote_run_stopped_when_spawn_fails() {
        let mut server = Server::new_async().await;
        let (_start, stop) = remote_run(&mut server).await;

        let mut config = config(Target::Spawn {
            program: "/nonexistent/tirion-target".to_string(),
            args: vec![],
        });
        config.name = "p".to_string();
        config.sink = SinkConfig::from_server(Some(&server.url()));

        let result = Agent::new(config).run().await;
        assert!(matches!(
            result,
            Err(AgentError::Process(crate::errors::ProcessError::Spawn { .. }))
        ));
        stop.assert_async().await;
    }

    #[tokio::test]
    async fn test_time_limit_ends_run() {
        let mut config = config(sh("sleep 30"));
        config.limits.time = Some(Duration::from_millis(100));
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            Agent::new(config)
                .with_csv_writer(Box::new(SharedBuffer::default()))
                .run(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!summary.exit_status.unwrap().success());
    }

    #[tokio::test]
    async fn test_attach_missing_process() {
        let mut config = config(Target::Attach { pid: i32::MAX });
        config.proc_root = tempfile::tempdir().unwrap().path().to_path_buf();
        let result = Agent::new(config)
            .with_csv_writer(Box::new(SharedBuffer::default()))
            .run()
            .await;
        assert!(matches!(
            result,
            Err(AgentError::Process(crate::errors::ProcessError::NotFound(_)))
        ));
    }
}
