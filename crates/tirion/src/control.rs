// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line based control channel between agent and client.
//!
//! ```text
//! client -> agent   tirion v<version>\t<protocol>[,<protocol>...]
//! agent  -> client  <internal metric count>\t<collector url>
//! client -> agent   t<tag text>          (any number of times)
//! ```
//!
//! Every message is a single line terminated by `\n`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::constants::{BUFFER_SIZE, COMMAND_TAG, VERSION};
use crate::errors::ProtocolError;

#[allow(clippy::unwrap_used)]
fn hello_regex() -> &'static Regex {
    static HELLO: OnceLock<Regex> = OnceLock::new();
    HELLO.get_or_init(|| Regex::new(r"^tirion v([0-9.]+)\t([a-z,]+)$").unwrap())
}

/// First message of a client: its protocol version and collector preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: String,
    pub protocols: String,
}

impl ClientHello {
    pub fn new(protocols: &str) -> Self {
        Self {
            version: VERSION.to_string(),
            protocols: protocols.to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let captures = hello_regex()
            .captures(line)
            .ok_or_else(|| ProtocolError::Handshake(line.to_string()))?;

        Ok(Self {
            version: captures[1].to_string(),
            protocols: captures[2].to_string(),
        })
    }
}

impl fmt::Display for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tirion v{}\t{}", self.version, self.protocols)
    }
}

/// The agent's answer to a [`ClientHello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub count: usize,
    pub url: String,
}

impl HandshakeReply {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidReply(line.to_string());
        let (count, url) = line.split_once('\t').ok_or_else(invalid)?;
        if url.is_empty() {
            return Err(invalid());
        }
        let count = count.parse::<usize>().map_err(|_| invalid())?;

        Ok(Self {
            count,
            url: url.to_string(),
        })
    }
}

impl fmt::Display for HandshakeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.count, self.url)
    }
}

/// Commands sent after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Tag(String),
}

impl ControlCommand {
    /// Decodes one received line. Unknown commands yield `None`.
    pub fn decode(line: &str) -> Option<Self> {
        let mut chars = line.chars();
        match chars.next() {
            Some(COMMAND_TAG) => Some(Self::Tag(chars.as_str().to_string())),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Tag(text) => format!("{COMMAND_TAG}{text}"),
        }
    }
}

/// Unix socket the agent waits on for its single client.
///
/// The socket file is removed again when the listener is dropped.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Binds `path`, replacing a stale socket file left by an earlier run.
    pub fn bind(path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale unix socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        debug!("Listening on unix socket {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits at most `timeout` for the client to connect.
    pub async fn accept(&self, timeout: Duration) -> Result<ControlConnection, ProtocolError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(ControlConnection::new(stream)),
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_) => Err(ProtocolError::AcceptTimeout(timeout)),
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Cannot remove unix socket {}: {e}", self.path.display());
            }
        }
    }
}

/// The agent's end of an accepted client connection.
#[derive(Debug)]
pub struct ControlConnection {
    reader: LineReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    fn new(stream: UnixStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: LineReader::new(read),
            writer,
        }
    }

    /// Reads the client hello and returns it. End of stream here is an error.
    pub async fn read_hello(&mut self) -> Result<ClientHello, ProtocolError> {
        let line = self
            .reader
            .next_line()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)?;
        let hello = ClientHello::parse(&line)?;
        debug!("Requested tirion protocol version v{}", hello.version);

        Ok(hello)
    }

    pub async fn send_reply(&mut self, reply: &HandshakeReply) -> Result<(), ProtocolError> {
        debug!("Send metric count {} and metric protocol URL {}", reply.count, reply.url);
        self.write_line(&reply.to_string()).await
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        self.writer.write_all(format!("{line}\n").as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Gives up the write half; the command listener only needs to read.
    pub fn into_reader(self) -> LineReader<OwnedReadHalf> {
        self.reader
    }
}

/// Reads newline terminated messages, trimming the terminator.
///
/// Messages longer than [`BUFFER_SIZE`] are cut at that length.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_SIZE, inner),
            buf: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    /// Next line, or `None` once the peer closed the connection.
    pub async fn next_line(&mut self) -> Result<Option<String>, io::Error> {
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        self.buf.truncate(BUFFER_SIZE);

        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
