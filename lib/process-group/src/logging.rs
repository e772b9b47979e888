// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for binaries and tests.
//!
//! Filters come from the `DYN_LOG` environment variable using `EnvFilter`
//! syntax, e.g. `DYN_LOG=info,dynamo_process_group::rendezvous=debug`. The
//! default level is `info`. Output is compact text on stderr; set
//! `DYN_DISABLE_ANSI_LOGGING=1` to strip colors.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

/// ENV used to disable ANSI colors
const DISABLE_ANSI_ENV: &str = "DYN_DISABLE_ANSI_LOGGING";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let l = fmt::layer()
        .with_ansi(!disable_ansi_logging())
        .event_format(fmt::format().compact().with_thread_names(true))
        .with_writer(std::io::stderr)
        .with_filter(filters());
    // a subscriber installed by the host application wins
    let _ = tracing_subscriber::registry().with(l).try_init();
}

fn filters() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}

fn disable_ansi_logging() -> bool {
    std::env::var(DISABLE_ANSI_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}
