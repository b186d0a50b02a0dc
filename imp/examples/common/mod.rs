// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Setup shared by the pipeline demos.

use std::path::Path;

use imp::config::RuntimeConfig;
use tracing::info;

/// Logs to stdout at INFO unless `RUST_LOG` says otherwise.
///
/// Thread names are included since producers and consumers log from
/// different threads.
pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// Loads the runtime configuration for a demo run.
///
/// An explicit `--config` file wins over `IMP_CONFIG`; with neither the
/// defaults apply.
pub fn load_config(path: Option<&Path>) -> imp::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading runtime configuration.");
            RuntimeConfig::from_file(path)?
        }
        None => RuntimeConfig::from_env()?,
    };
    info!(
        in_flight_frames = config.in_flight_frames,
        max_pools = config.max_pools,
        max_channels = config.max_channels,
        "Runtime configuration ready."
    );
    Ok(config)
}
