// Configuration options recognized by the engine.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// The role a linked process plays relative to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Prompt,
    Decoder,
    Mix,
}

impl FromStr for Role {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prompt" => Ok(Role::Prompt),
            "decoder" => Ok(Role::Decoder),
            "mix" => Ok(Role::Mix),
            other => Err(EngineError::ParamInvalid(format!("unknown role: {other}"))),
        }
    }
}

/// Sizing for an owned memory pool (`mem_pool_config` / `host_mem_pool_config`).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MemPoolConfig {
    pub memory_size: u64,
}

impl MemPoolConfig {
    pub fn parse(json: &str) -> Result<Self> {
        let parsed: MemPoolConfig = serde_json::from_str(json)?;
        if parsed.memory_size == 0 {
            return Err(EngineError::ParamInvalid(
                "mem_pool_config.memory_size must be > 0".into(),
            ));
        }
        Ok(parsed)
    }
}

/// Top-level engine configuration, assembled from the recognized options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub device_id: u32,
    pub role: Role,
    pub mem_pool_config: MemPoolConfig,
    pub host_mem_pool_config: Option<MemPoolConfig>,
    pub sync_kv_cache_wait_time_ms: u32,
    pub listen_ip_info: Option<(Ipv4Addr, u16)>,
    pub enable_remote_cache_accessible: bool,
    pub link_retry_count: u32,
    pub link_total_time_s: u32,
}

/// Fallback request timeout when a request carries none (`send_state.cc`
/// `kDefaultTimeoutInMs`, 1800s).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

impl EngineConfig {
    /// Builds a config from the raw string options the public API accepts.
    /// `device_id` and `mem_pool_config` are required; everything else has
    /// a default.
    pub fn from_options(
        options: &std::collections::HashMap<String, String>,
    ) -> Result<Self> {
        let device_id = options
            .get("device_id")
            .ok_or_else(|| EngineError::ParamInvalid("device_id is required".into()))?
            .parse::<u32>()
            .map_err(|e| EngineError::ParamInvalid(format!("device_id: {e}")))?;

        let role = options
            .get("role")
            .map(|s| Role::from_str(s))
            .transpose()?
            .unwrap_or(Role::Mix);

        let mem_pool_config = options
            .get("mem_pool_config")
            .ok_or_else(|| EngineError::ParamInvalid("mem_pool_config is required".into()))
            .and_then(|json| MemPoolConfig::parse(json))?;

        let host_mem_pool_config = options
            .get("host_mem_pool_config")
            .map(|json| MemPoolConfig::parse(json))
            .transpose()?;

        let sync_kv_cache_wait_time_ms = options
            .get("sync_kv_cache_wait_time_ms")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|e| EngineError::ParamInvalid(format!("sync_kv_cache_wait_time_ms: {e}")))?
            .filter(|v| *v > 0)
            .unwrap_or(1000);

        let listen_ip_info = options
            .get("listen_ip_info")
            .map(|s| parse_ip_port(s))
            .transpose()?;

        let enable_remote_cache_accessible = options
            .get("enable_remote_cache_accessible")
            .map(|s| match s.as_str() {
                "0" => Ok(false),
                "1" => Ok(true),
                other => Err(EngineError::ParamInvalid(format!(
                    "enable_remote_cache_accessible must be 0 or 1, got {other}"
                ))),
            })
            .transpose()?
            .unwrap_or(false);

        let link_retry_count = options
            .get("link_retry_count")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|e| EngineError::ParamInvalid(format!("link_retry_count: {e}")))?
            .unwrap_or(1);
        if !(1..=10).contains(&link_retry_count) {
            return Err(EngineError::ParamInvalid(
                "link_retry_count must be in [1, 10]".into(),
            ));
        }

        let link_total_time_s = options
            .get("link_total_time_s")
            .map(|s| s.parse::<u32>())
            .transpose()
            .map_err(|e| EngineError::ParamInvalid(format!("link_total_time_s: {e}")))?
            .unwrap_or(30);

        Ok(EngineConfig {
            device_id,
            role,
            mem_pool_config,
            host_mem_pool_config,
            sync_kv_cache_wait_time_ms,
            listen_ip_info,
            enable_remote_cache_accessible,
            link_retry_count,
            link_total_time_s,
        })
    }
}

fn parse_ip_port(s: &str) -> Result<(Ipv4Addr, u16)> {
    let (ip, port) = s
        .rsplit_once(':')
        .ok_or_else(|| EngineError::ParamInvalid(format!("listen_ip_info malformed: {s}")))?;
    let ip = Ipv4Addr::from_str(ip)
        .map_err(|e| EngineError::ParamInvalid(format!("listen_ip_info ip: {e}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| EngineError::ParamInvalid(format!("listen_ip_info port: {e}")))?;
    Ok((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> std::collections::HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn requires_device_id_and_mem_pool_config() {
        let err = EngineConfig::from_options(&opts(&[])).unwrap_err();
        assert_eq!(err.kind(), "ParamInvalid");
    }

    #[test]
    fn mem_pool_config_must_be_valid_json() {
        let err = EngineConfig::from_options(&opts(&[
            ("device_id", "0"),
            ("mem_pool_config", "not json"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), "ParamInvalid");
    }

    #[test]
    fn parses_full_config() {
        let cfg = EngineConfig::from_options(&opts(&[
            ("device_id", "0"),
            ("role", "prompt"),
            ("mem_pool_config", r#"{"memory_size": 1048576}"#),
            ("link_retry_count", "3"),
            ("listen_ip_info", "127.0.0.1:26000"),
        ]))
        .unwrap();
        assert_eq!(cfg.device_id, 0);
        assert_eq!(cfg.role, Role::Prompt);
        assert_eq!(cfg.mem_pool_config.memory_size, 1_048_576);
        assert_eq!(cfg.link_retry_count, 3);
        assert_eq!(cfg.listen_ip_info, Some((Ipv4Addr::new(127, 0, 0, 1), 26000)));
    }

    #[test]
    fn rejects_link_retry_count_out_of_range() {
        let err = EngineConfig::from_options(&opts(&[
            ("device_id", "0"),
            ("mem_pool_config", r#"{"memory_size": 1024}"#),
            ("link_retry_count", "11"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), "ParamInvalid");
    }
}
