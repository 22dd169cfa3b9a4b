// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for the samples and tags of a run.

pub mod csv;
pub mod remote;

use std::io::Write;

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::message::{Run, Sample, Tag};

pub use self::csv::CsvSink;
pub use self::remote::RemoteSink;

/// A run scoped destination. Every error it returns ends the run.
#[async_trait]
pub trait Sink: Send {
    /// Announces the run. A remote sink assigns `run.id`.
    async fn start_run(&mut self, run: &mut Run) -> Result<(), SinkError>;

    /// Stores consecutive samples in one call.
    async fn insert_metrics(&mut self, samples: &[Sample]) -> Result<(), SinkError>;

    async fn insert_tag(&mut self, tag: &Tag) -> Result<(), SinkError>;

    /// Closes the run and stamps `run.stop_time`. Nothing is accepted afterwards.
    async fn stop_run(&mut self, run: &mut Run) -> Result<(), SinkError>;
}

/// Which sink a run writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// A run server at `host:port` or a full base URL.
    Remote { server: String },
    /// `;` delimited rows on stdout.
    Csv,
}

impl SinkConfig {
    /// An empty server address selects the CSV sink.
    pub fn from_server(server: Option<&str>) -> Self {
        match server.map(str::trim) {
            Some(server) if !server.is_empty() => Self::Remote {
                server: server.to_string(),
            },
            _ => Self::Csv,
        }
    }

    pub fn open(&self) -> Result<AnySink, SinkError> {
        match self {
            Self::Remote { server } => Ok(AnySink::Remote(RemoteSink::new(server)?)),
            Self::Csv => Ok(AnySink::Csv(CsvSink::new(Box::new(std::io::stdout())))),
        }
    }

    /// Like [`open`](Self::open), but a CSV sink writes to `writer` instead of stdout.
    pub fn open_with_writer(
        &self,
        writer: Box<dyn Write + Send>,
    ) -> Result<AnySink, SinkError> {
        match self {
            Self::Remote { .. } => self.open(),
            Self::Csv => Ok(AnySink::Csv(CsvSink::new(writer))),
        }
    }
}

/// The configured sink of a running agent.
pub enum AnySink {
    Remote(RemoteSink),
    Csv(CsvSink),
}

#[async_trait]
impl Sink for AnySink {
    async fn start_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        match self {
            Self::Remote(sink) => sink.start_run(run).await,
            Self::Csv(sink) => sink.start_run(run).await,
        }
    }

    async fn insert_metrics(&mut self, samples: &[Sample]) -> Result<(), SinkError> {
        match self {
            Self::Remote(sink) => sink.insert_metrics(samples).await,
            Self::Csv(sink) => sink.insert_metrics(samples).await,
        }
    }

    async fn insert_tag(&mut self, tag: &Tag) -> Result<(), SinkError> {
        match self {
            Self::Remote(sink) => sink.insert_tag(tag).await,
            Self::Csv(sink) => sink.insert_tag(tag).await,
        }
    }

    async fn stop_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        match self {
            Self::Remote(sink) => sink.stop_run(run).await,
            Self::Csv(sink) => sink.stop_run(run).await,
        }
    }
}
