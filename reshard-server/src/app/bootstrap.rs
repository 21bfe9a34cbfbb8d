use std::fs;

use reshard_common::config::{QueuePolicy, ReshardConfig};
use reshard_common::error::ReshardResult;
use tracing_subscriber::EnvFilter;

use super::ConfigArgs;

/// Installs the stderr log subscriber. `RUST_LOG` overrides the default `info` filter.
pub(super) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

/// Builds the configuration from the optional JSON file, then applies flag overrides.
pub(super) fn load_config(args: &ConfigArgs) -> ReshardResult<ReshardConfig> {
    let mut config = match &args.config {
        Some(path) => ReshardConfig::from_json(&fs::read_to_string(path)?)?,
        None => ReshardConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.search.seed = Some(seed);
    }
    if let Some(secs) = args.time_limit_secs {
        config.placement.time_limit_secs = secs;
    }
    if let Some(generations) = args.generations {
        config.search.generations = generations;
    }
    if let Some(capacity) = args.queue_capacity {
        config.pipeline.queue = QueuePolicy::Bounded(capacity);
    }
    config.validate()?;
    Ok(config)
}
