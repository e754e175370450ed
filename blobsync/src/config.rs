//! Configuration for [`BlobSync`](crate::BlobSync) and [`BlobStore`](crate::store::BlobStore).

use std::{path::Path, time::Duration};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::defaults;

/// Tuning knobs of the sync engine.
///
/// Every field has a default, so a config file only needs to list what it changes:
///
/// ```toml
/// max_concurrent_uploads = 8
/// min_want_list_update_interval = "100ms"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chunk size for blobs written with [`BlobStore::set`](crate::store::BlobStore::set).
    pub default_chunk_size: u32,
    /// Minimum time between two want lists sent to the same peer.
    #[serde(with = "humantime_serde")]
    pub min_want_list_update_interval: Duration,
    /// Maximum number of chunk pushes in flight per connection.
    pub max_concurrent_uploads: usize,
    /// Timeout for a single RPC call.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Seed for the shuffling of upload candidates.
    ///
    /// `None` seeds from entropy. Set this to get reproducible upload orders in tests.
    pub shuffle_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_chunk_size: defaults::DEFAULT_CHUNK_SIZE,
            min_want_list_update_interval: defaults::MIN_WANT_LIST_UPDATE_INTERVAL,
            max_concurrent_uploads: defaults::MAX_CONCURRENT_UPLOADS,
            rpc_timeout: defaults::RPC_TIMEOUT,
            shuffle_seed: None,
        }
    }
}

/// Error loading a [`Config`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read {path}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid config"))]
    Parse { source: toml::de::Error },
    #[snafu(display("{field} must not be zero"))]
    Zero { field: &'static str },
}

impl Config {
    /// Loads the config from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path).await.context(ReadSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::from_toml(&s)
    }

    /// Parses the config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(s).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that sizes and limits are not zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        snafu::ensure!(
            self.default_chunk_size > 0,
            ZeroSnafu {
                field: "default_chunk_size"
            }
        );
        snafu::ensure!(
            self.max_concurrent_uploads > 0,
            ZeroSnafu {
                field: "max_concurrent_uploads"
            }
        );
        Ok(())
    }
}
