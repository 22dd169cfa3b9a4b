// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run server client.
//!
//! All requests are form encoded. Replies are JSON objects carrying an `Error` string that is
//! empty on success; the start reply additionally carries the assigned `Run` id.

use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::constants::DEFAULT_HTTP_TIMEOUT;
use crate::errors::SinkError;
use crate::message::{unix_nanos, Run, Sample, Tag};
use crate::sink::Sink;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartReply {
    #[serde(rename = "Run")]
    run: i32,
    #[serde(rename = "Error")]
    error: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorReply {
    #[serde(rename = "Error")]
    error: String,
}

/// Wire form of one sample inside an insert request.
#[derive(Debug, Serialize)]
struct MetricRow<'a> {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Data")]
    data: &'a [f32],
}

fn rfc3339(time: SystemTime) -> String {
    humantime::format_rfc3339_nanos(time).to_string()
}

pub struct RemoteSink {
    client: reqwest::Client,
    base_url: Url,
    /// `<base>/program/<name>/run/<id>` once the run was started.
    run_url: Option<Url>,
}

impl RemoteSink {
    /// `server` is either `host:port` or a base URL with scheme.
    pub fn new(server: &str) -> Result<Self, SinkError> {
        let base_url = base_url(server)?;
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|source| SinkError::Transport {
                request: "Client",
                source,
            })?;

        Ok(Self {
            client,
            base_url,
            run_url: None,
        })
    }

    /// Path of the started run, as sent on the wire.
    pub fn run_path(&self) -> Option<&str> {
        self.run_url.as_ref().map(Url::path)
    }

    fn run_url(&self, action: &str) -> Result<Url, SinkError> {
        let run_url = self.run_url.as_ref().ok_or(SinkError::NotStarted)?;
        join(run_url, &[action])
    }

    async fn check(request: &'static str, response: Response) -> Result<String, SinkError> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(SinkError::Status { request, status });
        }

        response
            .text()
            .await
            .map_err(|source| SinkError::Transport { request, source })
    }

    fn check_error(request: &'static str, body: &str) -> Result<(), SinkError> {
        // the server may answer with an empty body
        let reply: ErrorReply = serde_json::from_str(body).unwrap_or_default();
        if reply.error.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Remote {
                request,
                message: reply.error,
            })
        }
    }
}

fn base_url(server: &str) -> Result<Url, SinkError> {
    let server = server.trim_end_matches('/');
    let url = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("http://{server}")
    };
    Url::parse(&url).map_err(|_| SinkError::InvalidServer(server.to_string()))
}

/// Appends percent-encoded path segments, so run names may hold any character.
fn join(url: &Url, segments: &[&str]) -> Result<Url, SinkError> {
    let mut joined = url.clone();
    joined
        .path_segments_mut()
        .map_err(|()| SinkError::InvalidServer(url.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(joined)
}

#[async_trait]
impl Sink for RemoteSink {
    async fn start_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        const REQUEST: &str = "Run";

        let metrics = serde_json::to_string(
            &run.metrics
                .iter()
                .map(crate::metric::MetricSpec::definition)
                .collect::<Vec<_>>(),
        )?;
        let mut form: Vec<(&str, String)> = vec![
            ("name", run.name.clone()),
            ("sub_name", run.sub_name.clone()),
            ("interval", run.interval.as_millis().to_string()),
            ("metrics", metrics),
            ("prog", run.prog.clone()),
        ];
        form.extend(
            run.prog_args
                .iter()
                .map(|arg| ("prog_arguments", arg.clone())),
        );

        debug!("Request new run ID");
        let response = self
            .client
            .post(join(&self.base_url, &["program", run.name.as_str(), "run", "start"])?)
            .form(&form)
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                request: REQUEST,
                source,
            })?;
        let body = Self::check(REQUEST, response).await?;
        let reply: StartReply = serde_json::from_str(&body)?;
        if !reply.error.is_empty() {
            return Err(SinkError::Remote {
                request: REQUEST,
                message: reply.error,
            });
        }

        debug!("Received run ID {}", reply.run);
        run.id = Some(reply.run);
        run.start_time = SystemTime::now();
        self.run_url = Some(join(
            &self.base_url,
            &["program", run.name.as_str(), "run", reply.run.to_string().as_str()],
        )?);
        Ok(())
    }

    async fn insert_metrics(&mut self, samples: &[Sample]) -> Result<(), SinkError> {
        const REQUEST: &str = "Insert";

        if samples.is_empty() {
            return Ok(());
        }
        let url = self.run_url("insert")?;
        let rows: Vec<MetricRow<'_>> = samples
            .iter()
            .map(|sample| MetricRow {
                time: rfc3339(sample.time()),
                data: sample.values(),
            })
            .collect();
        let metrics = serde_json::to_string(&rows)?;
        trace!("Send metrics to server: {metrics}");

        let response = self
            .client
            .post(url)
            .form(&[("metrics", metrics)])
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                request: REQUEST,
                source,
            })?;
        let body = Self::check(REQUEST, response).await?;
        Self::check_error(REQUEST, &body)
    }

    async fn insert_tag(&mut self, tag: &Tag) -> Result<(), SinkError> {
        const REQUEST: &str = "Tag";

        let url = self.run_url("tag")?;
        debug!("Send tag to server: {}", tag.text());
        let response = self
            .client
            .post(url)
            .form(&[
                ("tag", tag.text().to_string()),
                ("time", unix_nanos(tag.time()).to_string()),
            ])
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                request: REQUEST,
                source,
            })?;
        let body = Self::check(REQUEST, response).await?;
        Self::check_error(REQUEST, &body)
    }

    async fn stop_run(&mut self, run: &mut Run) -> Result<(), SinkError> {
        const REQUEST: &str = "Stop";

        let url = self.run_url("stop")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| SinkError::Transport {
                request: REQUEST,
                source,
            })?;
        let body = Self::check(REQUEST, response).await?;
        Self::check_error(REQUEST, &body)?;

        debug!("Stopped run {:?}", run.id);
        self.run_url = None;
        run.stop_time = Some(SystemTime::now());
        Ok(())
    }
}
