// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Value objects that travel from the sampler and command listener to the sinks.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::TAG_SIZE;
use crate::metric::MetricSpec;

/// One fused reading of all metrics, ordered by metric index.
///
/// Each tick builds a fresh `Sample`; the values are never shared with the shared segment or
/// with a previous sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    time: SystemTime,
    values: Vec<f32>,
}

impl Sample {
    #[must_use]
    pub fn new(time: SystemTime, values: Vec<f32>) -> Self {
        Self { time, values }
    }

    #[must_use]
    pub fn time(&self) -> SystemTime {
        self.time
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// An out-of-band annotation reported by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    time: SystemTime,
    text: String,
}

impl Tag {
    /// Creates a tag stamped with the current time.
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self::at(SystemTime::now(), text)
    }

    #[must_use]
    pub fn at(time: SystemTime, text: &str) -> Self {
        Self {
            time,
            text: prepare_tag(text),
        }
    }

    #[must_use]
    pub fn time(&self) -> SystemTime {
        self.time
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Item on the dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Sample(Sample),
    Tag(Tag),
}

/// Clips a raw tag to [`TAG_SIZE`] bytes and replaces newlines so it fits on one wire line.
///
/// Clipping never splits a UTF-8 character, so a multi-byte character straddling the limit is
/// dropped entirely.
#[must_use]
pub fn prepare_tag(tag: &str) -> String {
    let mut end = tag.len().min(TAG_SIZE);
    while !tag.is_char_boundary(end) {
        end -= 1;
    }
    tag[..end].replace('\n', " ")
}

/// Nanoseconds since the Unix epoch, the time representation of the CSV sink and tag RPC.
#[must_use]
pub fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_nanos()).ok())
        .unwrap_or_default()
}

/// A monitoring run as announced to the sink.
#[derive(Debug, Clone)]
pub struct Run {
    /// Assigned by a remote sink on start.
    pub id: Option<i32>,
    pub name: String,
    pub sub_name: String,
    pub interval: Duration,
    pub metrics: Vec<MetricSpec>,
    pub prog: String,
    pub prog_args: Vec<String>,
    pub start_time: SystemTime,
    /// Set by the sink once the run is stopped; a stopped run takes no more items.
    pub stop_time: Option<SystemTime>,
}

impl Run {
    #[must_use]
    pub fn new(
        name: &str,
        sub_name: &str,
        interval: Duration,
        metrics: Vec<MetricSpec>,
        prog: &str,
        prog_args: Vec<String>,
    ) -> Self {
        Self {
            id: None,
            name: sanitize_run_name(name),
            sub_name: sub_name.to_string(),
            interval,
            metrics,
            prog: prog.to_string(),
            prog_args,
            start_time: SystemTime::now(),
            stop_time: None,
        }
    }
}

/// Run names end up in URL paths, so slashes are replaced.
#[must_use]
pub fn sanitize_run_name(name: &str) -> String {
    name.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_tag_clips_to_tag_size() {
        let tag = prepare_tag(&"x".repeat(600));
        assert_eq!(tag.len(), 513);
    }

    #[test]
    fn test_prepare_tag_replaces_newlines() {
        assert_eq!(prepare_tag("line1\nline2"), "line1 line2");
        assert_eq!(prepare_tag("\n\n"), "  ");
    }

    #[test]
    fn test_prepare_tag_keeps_char_boundaries() {
        // 512 ASCII bytes followed by a two byte character crossing the limit
        let raw = format!("{}é", "a".repeat(512));
        let tag = prepare_tag(&raw);
        assert_eq!(tag.len(), 512);
        assert!(tag.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_tag_new_prepares_text() {
        let tag = Tag::new("a\nb");
        assert_eq!(tag.text(), "a b");
    }

    #[test]
    fn test_unix_nanos() {
        let time = UNIX_EPOCH + Duration::from_millis(1500);
        assert_eq!(unix_nanos(time), 1_500_000_000);
        assert_eq!(unix_nanos(UNIX_EPOCH), 0);
    }

    #[test]
    fn test_run_name_is_sanitized() {
        let run = Run::new(
            "/usr/bin/sleep",
            "",
            Duration::from_millis(250),
            Vec::new(),
            "/usr/bin/sleep",
            vec!["1".to_string()],
        );
        assert_eq!(run.name, "-usr-bin-sleep");
        assert!(run.stop_time.is_none());
        assert!(run.id.is_none());
    }
}
