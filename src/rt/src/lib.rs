// Copyright 2024 Yuanrong Scheduler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configures the scheduler binaries' logging.

use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Configure log targets for all `yr_*` crates. New crates that need
/// `TRACE` output get added here.
fn configure_targets(targets: Targets) -> Targets {
    targets
        .with_target("yr_scheduler", tracing::Level::DEBUG)
        .with_target("yr_meta_store", tracing::Level::INFO)
        .with_target("yr_common", tracing::Level::INFO)
        // Named events are intentionally quiet unless explicitly enabled.
        .with_target("events", tracing::Level::ERROR)
}

#[derive(Debug, Clone)]
pub struct LoggerSettings {
    pub colorful: bool,
}

impl LoggerSettings {
    pub fn new() -> Self {
        Self {
            colorful: console_supports_color(),
        }
    }
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self::new()
    }
}

fn console_supports_color() -> bool {
    std::env::var_os("NO_COLOR").is_none()
}

/// Initializes the global `tracing` subscriber. Must be called exactly once
/// per process, at the top of `main`.
pub fn init_logger(settings: LoggerSettings) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(settings.colorful)
        .with_thread_ids(false)
        .with_target(true);

    let env_targets = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse::<Targets>().ok())
        .unwrap_or_else(|| Targets::new().with_default(tracing::Level::INFO));

    tracing_subscriber::registry()
        .with(configure_targets(env_targets))
        .with(fmt_layer)
        .init();
}
