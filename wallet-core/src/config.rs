//! Configuration for the wallet

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Per-request money limits
    pub limits: LimitsConfig,

    /// Redemption intent configuration
    pub qr: QrConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet"),
            service_name: "wallet-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            limits: LimitsConfig::default(),
            qr: QrConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync the WAL on every committed money movement
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 2,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Ceilings applied to a single request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum amount of one top-up
    pub top_up_ceiling: Decimal,

    /// Maximum amount of one administrative refund
    pub refund_ceiling: Decimal,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            top_up_ceiling: Decimal::from(5_000),
            refund_ceiling: Decimal::from(10_000),
        }
    }
}

/// Redemption intent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrConfig {
    /// Lifetime of an issued intent (seconds)
    pub intent_ttl_secs: i64,

    /// Hex-encoded 32 byte Ed25519 seed. A random key is generated when absent,
    /// which invalidates outstanding intents on restart.
    pub signing_seed: Option<String>,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            intent_ttl_secs: 5 * 60,
            signing_seed: None,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(ceiling) = std::env::var("WALLET_TOP_UP_CEILING") {
            config.limits.top_up_ceiling = parse_env("WALLET_TOP_UP_CEILING", &ceiling)?;
        }

        if let Ok(ceiling) = std::env::var("WALLET_REFUND_CEILING") {
            config.limits.refund_ceiling = parse_env("WALLET_REFUND_CEILING", &ceiling)?;
        }

        if let Ok(ttl) = std::env::var("WALLET_INTENT_TTL_SECS") {
            config.qr.intent_ttl_secs = parse_env("WALLET_INTENT_TTL_SECS", &ttl)?;
        }

        if let Ok(seed) = std::env::var("WALLET_SIGNING_SEED") {
            config.qr.signing_seed = Some(seed);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every request fail
    pub fn validate(&self) -> crate::Result<()> {
        if self.limits.top_up_ceiling <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "top_up_ceiling must be positive".to_string(),
            ));
        }
        if self.limits.refund_ceiling <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "refund_ceiling must be positive".to_string(),
            ));
        }
        if self.qr.intent_ttl_secs <= 0 {
            return Err(crate::Error::Config(
                "intent_ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}
