// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single consumer of the dispatch queue and sole owner of the sink.
//!
//! Samples and tags are accumulated in arrival order and flushed on a send interval. Once
//! every [`DispatchHandle`] is dropped the queue is drained, flushed one final time and the run
//! is stopped. This holds however the run ended, even when nothing was ever sent.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::errors::{AgentError, SinkError};
use crate::message::{Message, Run, Sample};
use crate::sink::Sink;

/// Producer side of the dispatch queue. Sending waits while the queue is full.
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Message>,
}

impl DispatchHandle {
    pub async fn send(&self, message: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.tx.send(message).await
    }

    /// True once the dispatcher stopped consuming, for example after a sink failure.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What reached the sink over the lifetime of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub samples: usize,
    pub tags: usize,
    pub flushes: usize,
}

pub struct Dispatcher<S> {
    sink: S,
    run: Run,
    rx: mpsc::Receiver<Message>,
    send_interval: Duration,
    pending: Vec<Message>,
    stats: DispatchStats,
}

impl<S: Sink> Dispatcher<S> {
    /// `run` must already be started at `sink`.
    pub fn new(
        sink: S,
        run: Run,
        send_interval: Duration,
        capacity: usize,
    ) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = Self {
            sink,
            run,
            rx,
            send_interval,
            pending: Vec::new(),
            stats: DispatchStats::default(),
        };

        (dispatcher, DispatchHandle { tx })
    }

    /// Returns the stopped run.
    pub async fn run(mut self) -> Result<(Run, DispatchStats), AgentError> {
        debug!("Start handling messages");

        let mut ticker = interval_at(Instant::now() + self.send_interval, self.send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // a busy queue must not hold back the flush
                biased;
                _ = ticker.tick() => self.flush().await?,
                message = self.rx.recv() => match message {
                    Some(message) => self.pending.push(message),
                    None => break,
                },
            }
        }

        debug!("Dispatch queue closed, final flush of {} items", self.pending.len());
        self.flush().await?;

        if let Err(source) = self.sink.stop_run(&mut self.run).await {
            error!("Stop request failed: {source}");
            return Err(AgentError::Dispatch {
                source,
                unsent: Vec::new(),
            });
        }

        debug!("Stop handling messages");
        Ok((self.run, self.stats))
    }

    async fn flush(&mut self) -> Result<(), AgentError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut pending = std::mem::take(&mut self.pending).into_iter().peekable();
        let mut batch: Vec<Sample> = Vec::new();

        while let Some(message) = pending.next() {
            let result = match message {
                Message::Sample(sample) => {
                    batch.push(sample);
                    if matches!(pending.peek(), Some(Message::Sample(_))) {
                        continue;
                    }
                    let sent = self.sink.insert_metrics(&batch).await;
                    if sent.is_ok() {
                        self.stats.samples += batch.len();
                        batch.clear();
                    }
                    sent.map_err(|source| (source, None))
                }
                Message::Tag(tag) => {
                    let sent = self.sink.insert_tag(&tag).await;
                    if sent.is_ok() {
                        self.stats.tags += 1;
                    }
                    sent.map_err(|source| (source, Some(Message::Tag(tag))))
                }
            };

            if let Err((source, failed_tag)) = result {
                let mut unsent: Vec<Message> = batch.drain(..).map(Message::Sample).collect();
                unsent.extend(failed_tag);
                unsent.extend(pending);
                return Err(self.fail(source, unsent));
            }
        }

        self.stats.flushes += 1;
        Ok(())
    }

    /// Stops accepting messages and collects everything that will never reach the sink.
    fn fail(&mut self, source: SinkError, mut unsent: Vec<Message>) -> AgentError {
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            unsent.push(message);
        }
        error!("{source}, {} items not delivered", unsent.len());

        AgentError::Dispatch { source, unsent }
    }
}
