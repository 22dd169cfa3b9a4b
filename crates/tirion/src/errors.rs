// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::message::Message;

/// Metric definition violations. Validation stops at the first one found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No metrics defined")]
    EmptySet,
    #[error("Maximum of {max} metrics allowed")]
    TooManyMetrics { max: usize },
    #[error("No name defined for metric[{index}]")]
    MissingName { index: usize },
    #[error("Name of metric[{index}] exceeds maximum of 256 characters")]
    NameTooLong { index: usize, name: String },
    #[error("Name \"{name}\" of metric[{index}] uses illegal characters. Only a-z, A-Z, 0-9, ., - and _ are allowed")]
    InvalidNameChars { index: usize, name: String },
    #[error("Name \"{name}\" of metric[{index}] already used for metric[{first}]")]
    DuplicateName {
        index: usize,
        name: String,
        first: usize,
    },
    #[error("No type defined for metric[{index}]")]
    MissingType { index: usize, name: String },
    #[error("Unknown metric type \"{value_type}\" for metric[{index}]")]
    UnknownType {
        index: usize,
        name: String,
        value_type: String,
    },
    #[error("Unknown external metric \"{name}\" for metric[{index}]")]
    UnknownExternalMetric { index: usize, name: String },
}

/// Errors in the agent configuration or the metric definitions it was given.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Read metrics file {path}: {source}")]
    MetricsFile { path: PathBuf, source: io::Error },
    #[error("Parse metrics file: {0}")]
    MetricsJson(#[from] serde_json::Error),
    #[error("Wrong format for metrics definition \"{0}\"")]
    MetricsDefinition(String),
}

/// Errors creating, attaching or releasing a shared counter segment.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("Shared segment {0} already exists")]
    SegmentExists(String),
    #[error("Shared segment {0} not found")]
    NotFound(String),
    #[error("Shared segment {name} holds {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Shared segment {name}: {source}")]
    Io { name: String, source: io::Error },
}

/// Errors on the control channel between agent and client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Timeout after {0:?} waiting for a client on the control socket")]
    AcceptTimeout(Duration),
    #[error("Client did not send tirion protocol version: {0:?}")]
    Handshake(String),
    #[error("None of the requested metric protocols \"{0}\" is supported")]
    UnsupportedProtocol(String),
    #[error("Did not receive correct metric count and protocol URL: {0:?}")]
    InvalidReply(String),
    #[error("Invalid metric protocol URL \"{0}\"")]
    InvalidUrl(String),
    #[error("Timeout after {0:?} waiting for the client handshake")]
    HandshakeTimeout(Duration),
    #[error("Control channel closed during handshake")]
    UnexpectedEof,
    #[error("Control channel error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by a sink. All of them end the run.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Cannot do {request} request: {source}")]
    Transport {
        request: &'static str,
        source: reqwest::Error,
    },
    #[error("{request} request failed with status {status}")]
    Status {
        request: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("{request} request failed with returned error: {message}")]
    Remote {
        request: &'static str,
        message: String,
    },
    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Write to local sink: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid run server address \"{0}\"")]
    InvalidServer(String),
    #[error("Run was not started")]
    NotStarted,
}

/// Errors reading OS process statistics.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("Read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Errors around the monitored process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Cannot execute {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Spawned process {0} has no PID")]
    MissingPid(String),
    #[error("PID {0} does not exist")]
    NotFound(i32),
}

/// Errors surfaced by the in-process client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot open unix socket {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Cannot initialize metrics collector: {0}")]
    Collector(#[from] ShmError),
    #[error("Send to agent: {0}")]
    Io(#[from] io::Error),
    #[error("Client is closed")]
    Closed,
}

/// Everything that ends an agent run abnormally.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Cannot initialize metric collector: {0}")]
    Resource(#[from] ShmError),
    #[error("Listen to unix socket {path}: {source}")]
    Socket { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("Dispatch failed with {} unsent items: {source}", unsent.len())]
    Dispatch {
        source: SinkError,
        unsent: Vec<Message>,
    },
    #[error("Agent task failed: {0}")]
    Task(String),
}
