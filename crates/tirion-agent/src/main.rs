// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tirion::agent::{Agent, AgentHandle};
use tirion::constants::VERSION;
use tirion::errors::AgentError;

mod config;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = config::log_level_from_env();
    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        // stdout belongs to the CSV sink
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::Config::from_env().and_then(|c| c.agent_config()) {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on tirion agent startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Tirion agent v{VERSION} starting run {}", config.name);
    let agent = Agent::new(config);
    tokio::spawn(stop_on_signal(agent.handle()));

    match agent.run().await {
        Ok(summary) => {
            debug!(
                "Monitored PID {} with run {:?}, exit status {:?}, stopped at {:?}",
                summary.pid, summary.run_id, summary.exit_status, summary.stop_time
            );
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Err(AgentError::Dispatch { source, unsent }) => {
            error!("Metrics were not delivered: {source}");
            error!("{} samples and tags were lost", unsent.len());
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Stops the run gracefully on SIGINT or SIGTERM.
async fn stop_on_signal(handle: AgentHandle) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Cannot listen for SIGTERM: {e}");
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Cannot listen for SIGINT: {e}");
                return;
            }
            info!("Received SIGINT, stopping");
        }
        _ = terminate.recv() => info!("Received SIGTERM, stopping"),
    }
    handle.stop();
}
