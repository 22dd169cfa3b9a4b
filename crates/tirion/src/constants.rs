// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Version of the agent/client protocol, sent by the client in its hello line.
pub const VERSION: &str = "0.1";

/// Maximum length of a tag in bytes.
pub const TAG_SIZE: usize = 513;

/// Maximum length of a single control channel line.
pub const BUFFER_SIZE: usize = 4096;

/// Maximum length of a metric name.
pub const MAX_METRIC_NAME_LEN: usize = 256;

/// Prefix of metric names that are read from the OS instead of the application.
pub const EXTERNAL_METRIC_PREFIX: &str = "proc";

/// Command byte of a tag message sent by the client.
pub const COMMAND_TAG: char = 't';

/// Protocols a client asks for when none are configured.
pub const DEFAULT_CLIENT_PROTOCOLS: &str = "shm,mmap";

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MEMORY_LIMIT_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the queue between the sampler/listener and the dispatcher.
pub const DISPATCH_QUEUE_CAPACITY: usize = 100;

/// How long the command listener may keep draining the control channel after sampling stopped.
pub const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
