// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fnv::FnvHashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::collector::Collector;
use crate::dispatcher::DispatchHandle;
use crate::errors::ProcError;
use crate::message::{Message, Sample};
use crate::metric::MetricSet;
use crate::proc::{ProcReader, ProcSource};

/// Builds one [`Sample`] per interval from OS statistics and the shared counters.
pub struct Sampler {
    pid: i32,
    metrics: Arc<MetricSet>,
    reader: ProcReader,
    interval: Duration,
    collector: Option<Arc<Collector>>,
}

impl Sampler {
    pub fn new(
        pid: i32,
        metrics: Arc<MetricSet>,
        reader: ProcReader,
        interval: Duration,
        collector: Option<Arc<Collector>>,
    ) -> Self {
        Self {
            pid,
            metrics,
            reader,
            interval,
            collector,
        }
    }

    /// Reads every needed source once and fuses the result with a counter snapshot.
    pub fn sample(&self) -> Result<Sample, ProcError> {
        let mut sources = FnvHashMap::default();
        for source in self.metrics.sources() {
            sources.insert(source, self.reader.read(self.pid, source)?);
        }

        let counters = match &self.collector {
            Some(collector) if self.metrics.internal_count() > 0 => collector.snapshot(),
            _ => Vec::new(),
        };

        Ok(fuse(&self.metrics, SystemTime::now(), &sources, &counters))
    }

    /// Samples until the target is gone, `cancel` fires or the dispatcher stops consuming.
    ///
    /// `exited` is cancelled by whoever reaps the target. Returns the number of samples sent.
    pub async fn run(
        self,
        handle: DispatchHandle,
        exited: CancellationToken,
        cancel: CancellationToken,
    ) -> usize {
        debug!("Start fetching metrics for PID {}", self.pid);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Sampling cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if exited.is_cancelled() || !self.reader.exists(self.pid) {
                debug!("Program with PID {} is gone", self.pid);
                break;
            }

            let sample = match self.sample() {
                Ok(sample) => sample,
                Err(e) => {
                    // most likely the process exited between the liveness check and the read
                    warn!("Skipping sample: {e}");
                    continue;
                }
            };
            trace!("Sample {:?}", sample.values());

            // waits while the dispatch queue is full
            tokio::select! {
                result = handle.send(Message::Sample(sample)) => {
                    if result.is_err() {
                        debug!("Dispatcher stopped, stop sampling");
                        break;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Sampling cancelled with a full dispatch queue");
                    break;
                }
            }
            sent += 1;
        }

        debug!("Stop fetching metrics after {sent} samples");
        sent
    }
}

/// Places every value at its metric position. Missing values read as `0.0`.
pub fn fuse(
    metrics: &MetricSet,
    time: SystemTime,
    sources: &FnvHashMap<ProcSource, Vec<f64>>,
    counters: &[f32],
) -> Sample {
    let mut values = vec![0.0f32; metrics.len()];

    for (position, field) in metrics.external() {
        values[*position] = sources
            .get(&field.source)
            .and_then(|read| read.get(field.index))
            .map_or(0.0, |value| *value as f32);
    }
    for (slot, position) in metrics.internal().iter().enumerate() {
        values[*position] = counters.get(slot).copied().unwrap_or_default();
    }

    Sample::new(time, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{started_run, Call, RecordingSink};
    use crate::dispatcher::Dispatcher;
    use crate::metric::MetricDefinition;
    use std::fs;
    use std::path::Path;

    fn metrics() -> Arc<MetricSet> {
        Arc::new(
            MetricSet::new(&[
                MetricDefinition::new("proc.stat.utime", "int"),
                MetricDefinition::new("cache.hits", "float"),
            ])
            .unwrap(),
        )
    }

    fn write_stat(root: &Path, pid: i32, utime: u64) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{pid} (app) S 1 {pid} {pid} 0 -1 4194304 10 0 0 0 {utime} 5 0 0 20 0 1 0 100 2048 64 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_fuse_orders_by_metric_index() {
        let metrics = metrics();
        let mut sources = FnvHashMap::default();
        let mut stat = vec![0.0; 44];
        stat[13] = 100.0;
        sources.insert(ProcSource::Stat, stat);

        let sample = fuse(&metrics, SystemTime::now(), &sources, &[3.5]);
        assert_eq!(sample.values(), &[100.0, 3.5]);
    }

    #[test]
    fn test_fuse_without_counters() {
        let sample = fuse(&metrics(), SystemTime::now(), &FnvHashMap::default(), &[]);
        assert_eq!(sample.values(), &[0.0, 0.0]);
    }

    #[test]
    fn test_sample_reads_proc_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 4242, 100);

        let name = format!("/tirion-sampler-{}", std::process::id());
        let counters = crate::shm::SharedCounterArray::create(&name, 1).unwrap();
        counters.set(0, 3.5);
        let collector = Arc::new(Collector::Shm(counters));

        let sampler = Sampler::new(
            4242,
            metrics(),
            ProcReader::new(dir.path()),
            Duration::from_millis(10),
            Some(collector),
        );
        let first = sampler.sample().unwrap();
        assert_eq!(first.values(), &[100.0, 3.5]);

        // every tick owns its values
        let second = sampler.sample().unwrap();
        assert_eq!(first.values(), second.values());
        assert!(!std::ptr::eq(first.values(), second.values()));
    }

    #[tokio::test]
    async fn test_run_stops_when_process_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 77, 1);

        let sink = RecordingSink::default();
        let (dispatcher, handle) =
            Dispatcher::new(sink.clone(), started_run(), Duration::from_secs(3600), 100);
        let dispatch = tokio::spawn(dispatcher.run());

        let exited = CancellationToken::new();
        let sampler = Sampler::new(
            77,
            metrics(),
            ProcReader::new(dir.path()),
            Duration::from_millis(5),
            None,
        );
        let sampling = tokio::spawn(sampler.run(handle, exited.clone(), CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        exited.cancel();
        let sent = sampling.await.unwrap();
        assert!(sent >= 1);

        let (_, stats) = dispatch.await.unwrap().unwrap();
        assert_eq!(stats.samples, sent);
        let calls = sink.calls();
        assert_eq!(calls.last(), Some(&Call::Stop));
        match &calls[0] {
            Call::Metrics(samples) => assert_eq!(samples[0].values(), &[1.0, 0.0]),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_skips_unreadable_ticks() {
        let dir = tempfile::tempdir().unwrap();
        // the process directory exists but has no stat file
        fs::create_dir_all(dir.path().join("78")).unwrap();

        let (dispatcher, handle) = Dispatcher::new(
            RecordingSink::default(),
            started_run(),
            Duration::from_secs(3600),
            10,
        );
        let dispatch = tokio::spawn(dispatcher.run());
        let cancel = CancellationToken::new();
        let sampler = Sampler::new(
            78,
            metrics(),
            ProcReader::new(dir.path()),
            Duration::from_millis(5),
            None,
        );
        let sampling = tokio::spawn(sampler.run(handle, CancellationToken::new(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(sampling.await.unwrap(), 0);
        assert_eq!(dispatch.await.unwrap().unwrap().1.samples, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_dispatch_queue_is_full() {
        let dir = tempfile::tempdir().unwrap();
        write_stat(dir.path(), 79, 1);

        // the dispatcher never runs, so the single queue slot stays taken
        let (_dispatcher, handle) = Dispatcher::new(
            RecordingSink::default(),
            started_run(),
            Duration::from_secs(3600),
            1,
        );
        let cancel = CancellationToken::new();
        let sampler = Sampler::new(
            79,
            metrics(),
            ProcReader::new(dir.path()),
            Duration::from_millis(5),
            None,
        );
        let sampling = tokio::spawn(sampler.run(handle, CancellationToken::new(), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), sampling)
            .await
            .expect("sampler ignored the cancellation")
            .unwrap();
        assert_eq!(sent, 1);
    }
}
