// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured logging setup for the insights handler.
#![deny(unsafe_code)]

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the default level is `info`, or
/// `debug` when the debug toggle is on. Calling this twice is a no-op (the
/// second install attempt is discarded), which keeps tests that share a
/// process from fighting over the global subscriber.
pub fn init(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
