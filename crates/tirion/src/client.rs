// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process side used by the instrumented application.
//!
//! The client is blocking on purpose: it is linked into arbitrary programs and must not
//! require an async runtime. Counter updates go straight to the shared mapping; only tags
//! travel over the control socket.

use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::collector::Collector;
use crate::constants::DEFAULT_CLIENT_PROTOCOLS;
use crate::control::{ClientHello, ControlCommand, HandshakeReply};
use crate::errors::{ClientError, ProtocolError};
use crate::message::prepare_tag;

pub struct Client {
    socket: PathBuf,
    collector: Option<Collector>,
    stream: Mutex<Option<UnixStream>>,
    commands: Option<JoinHandle<()>>,
}

impl Client {
    /// Connects to the agent at `socket` asking for the default protocols.
    pub fn attach(socket: &Path) -> Result<Self, ClientError> {
        Self::attach_with_protocols(socket, DEFAULT_CLIENT_PROTOCOLS)
    }

    /// Connects and performs the handshake with a comma separated protocol preference list.
    pub fn attach_with_protocols(socket: &Path, protocols: &str) -> Result<Self, ClientError> {
        debug!("Open unix socket to {}", socket.display());
        let mut stream = UnixStream::connect(socket).map_err(|source| ClientError::Connect {
            path: socket.to_path_buf(),
            source,
        })?;

        let hello = ClientHello::new(protocols);
        debug!("Request tirion protocol version v{}", hello.version);
        writeln!(stream, "{hello}")?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        if reader.read_line(&mut line).map_err(ProtocolError::Io)? == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        let reply = HandshakeReply::parse(line.trim_end_matches(['\n', '\r']))?;
        debug!(
            "Received metric count {} and protocol URL {}",
            reply.count, reply.url
        );

        let collector = Collector::init_as_consumer(&reply.url, reply.count)?;
        debug!("Initialized metric collector {}", collector.kind());

        let commands = std::thread::Builder::new()
            .name("tirion-commands".to_string())
            .spawn(move || handle_commands(reader))?;

        Ok(Self {
            socket: socket.to_path_buf(),
            collector: Some(collector),
            stream: Mutex::new(Some(stream)),
            commands: Some(commands),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Number of counters shared with the agent.
    pub fn len(&self) -> usize {
        self.collector.as_ref().map_or(0, Collector::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: i32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.get(index))
    }

    /// Returns the previous value.
    pub fn set(&self, index: i32, value: f32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.set(index, value))
    }

    /// Returns the new value.
    pub fn add(&self, index: i32, delta: f32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.add(index, delta))
    }

    pub fn sub(&self, index: i32, delta: f32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.sub(index, delta))
    }

    pub fn inc(&self, index: i32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.inc(index))
    }

    pub fn dec(&self, index: i32) -> f32 {
        self.collector.as_ref().map_or(0.0, |c| c.dec(index))
    }

    /// Sends a tag to the agent, which stamps it on receipt.
    pub fn tag(&self, text: &str) -> Result<(), ClientError> {
        let line = ControlCommand::Tag(prepare_tag(text)).encode();
        let mut stream = self.stream.lock().map_err(|_| ClientError::Closed)?;
        let stream = stream.as_mut().ok_or(ClientError::Closed)?;
        writeln!(stream, "{line}")?;
        Ok(())
    }

    /// Detaches from the counters and closes the socket. The agent owns and removes the
    /// counters. Calling it again does nothing.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut collector) = self.collector.take() {
            collector.close()?;
        }

        let stream = match self.stream.get_mut() {
            Ok(stream) => stream.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(stream) = stream {
            // also wakes the command thread blocked on its read
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("Shutdown of control socket failed: {e}");
            }
        }

        if let Some(commands) = self.commands.take() {
            if commands.join().is_err() {
                error!("Command thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing client: {e}");
        }
    }
}

/// The agent sends no commands yet; anything received is logged and skipped.
fn handle_commands(mut reader: BufReader<UnixStream>) {
    debug!("Start listening to commands");
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                debug!("Unix socket got closed with EOF");
                break;
            }
            Ok(_) => warn!("Unknown command {:?}", line.chars().next()),
            Err(e) => {
                debug!("Unix socket got closed: {e}");
                break;
            }
        }
    }
    debug!("Stop listening to commands");
}
