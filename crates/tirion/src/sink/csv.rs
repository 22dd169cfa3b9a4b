// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::SinkError;
use crate::message::{unix_nanos, Run, Sample, Tag};
use crate::sink::Sink;

const DELIMITER: char = ';';

/// Writes `time;tag;<metric names...>` rows, one per sample or tag, in arrival order.
pub struct CsvSink {
    writer: Box<dyn Write + Send>,
    columns: usize,
    started: bool,
}

impl CsvSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            columns: 0,
            started: false,
        }
    }

    fn write_row<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<(), SinkError> {
        let row = fields
            .into_iter()
            .map(quote)
            .collect::<Vec<_>>()
            .join(&DELIMITER.to_string());
        self.writer.write_all(row.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), SinkError> {
        if self.started {
            Ok(())
        } else {
            Err(SinkError::NotStarted)
        }
    }
}

fn quote(field: &str) -> String {
    if field.contains([DELIMITER, '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[async_trait]
impl Sink for CsvSink {
    async fn start_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        self.columns = run.metrics.len();
        let header: Vec<&str> = ["time", "tag"]
            .into_iter()
            .chain(run.metrics.iter().map(|metric| metric.name.as_str()))
            .collect();
        self.write_row(header)?;
        self.writer.flush()?;
        self.started = true;
        debug!("Started CSV run with {} metric columns", self.columns);
        Ok(())
    }

    async fn insert_metrics(&mut self, samples: &[Sample]) -> Result<(), SinkError> {
        self.ensure_started()?;
        for sample in samples {
            let time = unix_nanos(sample.time()).to_string();
            let values: Vec<String> = sample.values().iter().map(|v| format!("{v:.3}")).collect();
            self.write_row(
                [time.as_str(), ""]
                    .into_iter()
                    .chain(values.iter().map(String::as_str)),
            )?;
        }
        self.writer.flush()?;
        Ok(())
    }

    async fn insert_tag(&mut self, tag: &Tag) -> Result<(), SinkError> {
        self.ensure_started()?;
        let time = unix_nanos(tag.time()).to_string();
        let empty = std::iter::repeat("").take(self.columns);
        self.write_row([time.as_str(), tag.text()].into_iter().chain(empty))?;
        self.writer.flush()?;
        Ok(())
    }

    async fn stop_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        self.ensure_started()?;
        self.writer.flush()?;
        self.started = false;
        run.stop_time = Some(SystemTime::now());
        Ok(())
    }
}
