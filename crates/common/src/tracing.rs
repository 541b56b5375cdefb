// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Shared tracing initialization for tempora binaries and test harnesses.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

fn build_filter(debug_fallback: bool) -> EnvFilter {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        let level = if debug_fallback { "debug" } else { "info" };
        EnvFilter::new(level)
    }
}

/// Initialize tracing with environment-based configuration and fallback support
///
/// - Uses `RUST_LOG` environment variable when available
/// - Falls back to DEBUG when `debug_fallback` is set, INFO otherwise
/// - Thread names are included, since most interesting output comes from batch workers and the
///   notification dispatcher
pub fn init_tracing(debug_fallback: bool) -> Result<(), eyre::Report> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(true)
                .with_file(true)
                .with_target(false)
                .with_line_number(true)
                .with_thread_names(true)
                .with_span_events(fmt::format::FmtSpan::NONE),
        )
        .with(build_filter(debug_fallback))
        .try_init()
        .map_err(|e| eyre::eyre!("Unable to initialize tracing: {e}"))
}

/// Initialize tracing for tests. Safe to call from every test; only the first call installs the
/// subscriber, and output goes through the test writer so it's captured per-test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_test_writer()
                .with_target(false)
                .with_thread_names(true),
        )
        .with(build_filter(false))
        .try_init();
}
