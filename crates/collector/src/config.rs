//! Collector configuration loading
//!
//! An optional file (YAML, TOML or JSON by extension) is layered under
//! `SENTINEL_*` environment variables, where `__` separates nested keys:
//! `SENTINEL_KAFKA__BROKERS=kafka-0:9092,kafka-1:9092`.

use anyhow::{Context, Result};
use collector_lib::config::CollectorConfig;
use std::path::Path;

const ENV_PREFIX: &str = "SENTINEL";

/// Load and validate configuration
pub fn load(path: Option<&Path>) -> Result<CollectorConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let config: CollectorConfig = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("kafka.brokers"),
        )
        .build()
        .context("failed to read configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    config.validate()?;
    Ok(config)
}
