// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process metric monitoring with application counters shared over POSIX shared memory.
//!
//! The agent side spawns or attaches to a target process, samples its OS counters at a fixed
//! interval, fuses them with counters the instrumented application mutates in a shared segment,
//! and ships the resulting time series to a remote run server or a local CSV stream. The client
//! side ([`client::Client`]) is linked into the monitored application and negotiates the shared
//! segment with the agent over a unix control socket.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod client;
pub mod collector;
pub mod constants;
pub mod control;
pub mod dispatcher;
pub mod errors;
pub mod message;
pub mod metric;
pub mod proc;
pub mod process;
pub mod sampler;
pub mod shm;
pub mod sink;
