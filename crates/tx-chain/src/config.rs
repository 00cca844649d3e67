use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;
use crate::network::BtcNetwork;

/// Smallest output the engine will emit (P2PKH-era dust relay threshold).
pub const DEFAULT_MIN_OUTPUT_SAT: u64 = 546;
const DEFAULT_SETTLE_INTERVAL_MS: u64 = 2_000;
const DEFAULT_BROADCAST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SERVICE_FEE_FLOOR_SAT: u64 = 1_000;
const DEFAULT_MARKET_FEE_BPS: u64 = 100;
const DEFAULT_MARKET_FEE_MIN_SAT: u64 = 1_000;
/// Keeps a single payload comfortably under the 400k weight-unit standard limit.
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 390_000;

/// Engine tunables. Every field has a default; deployments override through
/// JSON or `MINT_ENGINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: BtcNetwork,
    pub min_output_value_sat: u64,
    pub settle_interval_ms: u64,
    pub broadcast_timeout_ms: u64,
    pub service_fee_floor_sat: u64,
    pub market_fee_bps: u64,
    pub market_fee_min_sat: u64,
    pub max_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: BtcNetwork::Mainnet,
            min_output_value_sat: DEFAULT_MIN_OUTPUT_SAT,
            settle_interval_ms: DEFAULT_SETTLE_INTERVAL_MS,
            broadcast_timeout_ms: DEFAULT_BROADCAST_TIMEOUT_MS,
            service_fee_floor_sat: DEFAULT_SERVICE_FEE_FLOOR_SAT,
            market_fee_bps: DEFAULT_MARKET_FEE_BPS,
            market_fee_min_sat: DEFAULT_MARKET_FEE_MIN_SAT,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl EngineConfig {
    /// Read the config from `MINT_ENGINE_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, EngineError> {
        let defaults = Self::default();

        let network = match env_var("MINT_ENGINE_NETWORK") {
            Some(raw) => raw.parse()?,
            None => defaults.network,
        };

        let config = Self {
            network,
            min_output_value_sat: parse_env(
                "MINT_ENGINE_MIN_OUTPUT_SAT",
                defaults.min_output_value_sat,
            )?,
            settle_interval_ms: parse_env(
                "MINT_ENGINE_SETTLE_INTERVAL_MS",
                defaults.settle_interval_ms,
            )?,
            broadcast_timeout_ms: parse_env(
                "MINT_ENGINE_BROADCAST_TIMEOUT_MS",
                defaults.broadcast_timeout_ms,
            )?,
            service_fee_floor_sat: parse_env(
                "MINT_ENGINE_SERVICE_FEE_FLOOR_SAT",
                defaults.service_fee_floor_sat,
            )?,
            market_fee_bps: parse_env("MINT_ENGINE_MARKET_FEE_BPS", defaults.market_fee_bps)?,
            market_fee_min_sat: parse_env(
                "MINT_ENGINE_MARKET_FEE_MIN_SAT",
                defaults.market_fee_min_sat,
            )?,
            max_payload_bytes: parse_env(
                "MINT_ENGINE_MAX_PAYLOAD_BYTES",
                defaults.max_payload_bytes,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(format!("malformed config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.min_output_value_sat == 0 {
            return Err(EngineError::InvalidConfig(
                "min_output_value_sat must be > 0".into(),
            ));
        }
        if self.broadcast_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "broadcast_timeout_ms must be > 0".into(),
            ));
        }
        if self.market_fee_bps > 10_000 {
            return Err(EngineError::InvalidConfig(
                "market_fee_bps must be in 0..=10000".into(),
            ));
        }
        if self.max_payload_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "max_payload_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, default_value: T) -> Result<T, EngineError> {
    match env_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| EngineError::InvalidConfig(format!("{key} must be a valid integer"))),
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.min_output_value_sat, 546);
        assert_eq!(cfg.settle_interval(), Duration::from_secs(2));
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let cfg =
            EngineConfig::from_json(r#"{ "network": "regtest", "settle_interval_ms": 0 }"#).unwrap();
        assert_eq!(cfg.network, BtcNetwork::Regtest);
        assert_eq!(cfg.settle_interval_ms, 0);
        assert_eq!(cfg.broadcast_timeout_ms, 30_000);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = EngineConfig::from_json("{ network: ").unwrap_err();
        assert!(err.to_string().contains("malformed config json"));
    }

    #[test]
    fn zero_min_output_is_rejected() {
        let cfg = EngineConfig {
            min_output_value_sat: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn market_fee_above_100_percent_is_rejected() {
        let cfg = EngineConfig {
            market_fee_bps: 10_001,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("market_fee_bps"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = EngineConfig::from_json(r#"{ "broadcast_timeout_ms": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("broadcast_timeout_ms"));
    }
}
