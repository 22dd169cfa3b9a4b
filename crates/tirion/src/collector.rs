// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! How application metrics are exchanged between client and agent.
//!
//! The agent produces the exchange (creates the counters) and announces it to the client as a
//! URL `<kind>:<location>`; the client consumes it by attaching to that location.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_more::Display;
use tracing::debug;

use crate::errors::{ClientError, ProtocolError, ShmError};
use crate::shm::{segment_name, SharedCounterArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CollectorKind {
    #[display("shm")]
    Shm,
    #[display("mmap")]
    Mmap,
}

impl CollectorKind {
    pub const SUPPORTED: [CollectorKind; 2] = [CollectorKind::Shm, CollectorKind::Mmap];
}

impl FromStr for CollectorKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shm" => Ok(Self::Shm),
            "mmap" => Ok(Self::Mmap),
            other => Err(ProtocolError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Picks the first entry of the client's comma separated preference list the agent supports.
pub fn negotiate(
    preferences: &str,
    supported: &[CollectorKind],
) -> Result<CollectorKind, ProtocolError> {
    preferences
        .split(',')
        .filter_map(|name| name.parse::<CollectorKind>().ok())
        .find(|kind| supported.contains(kind))
        .ok_or_else(|| ProtocolError::UnsupportedProtocol(preferences.to_string()))
}

/// Splits a `<kind>:<location>` URL.
pub fn parse_url(url: &str) -> Result<(CollectorKind, &str), ProtocolError> {
    let (kind, location) = url
        .split_once(':')
        .ok_or_else(|| ProtocolError::InvalidUrl(url.to_string()))?;
    if location.is_empty() {
        return Err(ProtocolError::InvalidUrl(url.to_string()));
    }
    let kind = kind
        .parse::<CollectorKind>()
        .map_err(|_| ProtocolError::InvalidUrl(url.to_string()))?;

    Ok((kind, location))
}

#[must_use]
pub fn format_url(kind: CollectorKind, location: &str) -> String {
    format!("{kind}:{location}")
}

/// Location of the file backing the `mmap` collector of a monitored PID.
#[must_use]
pub fn mmap_path(pid: i32) -> PathBuf {
    std::env::temp_dir().join(format!("tirion-{pid}.mmap"))
}

#[derive(Debug)]
pub enum Collector {
    Shm(SharedCounterArray),
    Mmap(SharedCounterArray),
}

impl Collector {
    /// Creates the counters for `count` internal metrics and returns the URL to hand to the
    /// client.
    pub fn init_as_producer(
        kind: CollectorKind,
        pid: i32,
        count: usize,
    ) -> Result<(Self, String), ShmError> {
        let collector = match kind {
            CollectorKind::Shm => {
                Self::Shm(SharedCounterArray::create(&segment_name(pid), count)?)
            }
            CollectorKind::Mmap => {
                Self::Mmap(SharedCounterArray::create_file(&mmap_path(pid), count)?)
            }
        };
        let url = format_url(kind, collector.counters().name());
        debug!("Collector {kind} ready at {url}");

        Ok((collector, url))
    }

    /// Attaches to counters announced by the agent. Closing the result never destroys them.
    pub fn init_as_consumer(url: &str, count: usize) -> Result<Self, ClientError> {
        let (kind, location) = parse_url(url)?;
        let collector = match kind {
            CollectorKind::Shm => Self::Shm(SharedCounterArray::attach(location, count)?),
            CollectorKind::Mmap => {
                Self::Mmap(SharedCounterArray::attach_file(Path::new(location), count)?)
            }
        };

        Ok(collector)
    }

    pub fn kind(&self) -> CollectorKind {
        match self {
            Self::Shm(_) => CollectorKind::Shm,
            Self::Mmap(_) => CollectorKind::Mmap,
        }
    }

    fn counters(&self) -> &SharedCounterArray {
        match self {
            Self::Shm(counters) | Self::Mmap(counters) => counters,
        }
    }

    pub fn url(&self) -> String {
        format_url(self.kind(), self.counters().name())
    }

    pub fn len(&self) -> usize {
        self.counters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters().is_empty()
    }

    pub fn snapshot(&self) -> Vec<f32> {
        self.counters().snapshot()
    }

    pub fn get(&self, index: i32) -> f32 {
        self.counters().get(index)
    }

    pub fn set(&self, index: i32, value: f32) -> f32 {
        self.counters().set(index, value)
    }

    pub fn add(&self, index: i32, delta: f32) -> f32 {
        self.counters().add(index, delta)
    }

    pub fn sub(&self, index: i32, delta: f32) -> f32 {
        self.counters().sub(index, delta)
    }

    pub fn inc(&self, index: i32) -> f32 {
        self.counters().inc(index)
    }

    pub fn dec(&self, index: i32) -> f32 {
        self.counters().dec(index)
    }

    pub fn close(&mut self) -> Result<(), ShmError> {
        match self {
            Self::Shm(counters) | Self::Mmap(counters) => counters.close(),
        }
    }
}
