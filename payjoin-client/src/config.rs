use std::path::Path;
use std::time::Duration;

use bitcoin::FeeRate;
use config::{ConfigError, File};
use serde::Deserialize;

/// How long the signed Original waits before it is broadcast as a fallback.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub fallback_delay: Duration,
    /// Rate the sender pays for block space the receiver adds. Defaults to the Original's fee rate.
    pub fee_rate_sat_per_vb: Option<u64>,
    /// The one output the receiver may take its fee contribution from.
    pub additional_fee_output_index: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            fee_rate_sat_per_vb: None,
            additional_fee_output_index: None,
        }
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            // Add from optional config file
            .add_source(File::from(path).required(false))
            // Add from the environment (with a prefix of PJ)
            // e.g. `PJ_FALLBACK_DELAY=60` would set the `fallback_delay`.
            .add_source(config::Environment::with_prefix("PJ"))
            .build()?
            .try_deserialize()
    }

    pub fn fee_rate(&self) -> Option<FeeRate> {
        self.fee_rate_sat_per_vb.and_then(FeeRate::from_sat_per_vb)
    }
}
