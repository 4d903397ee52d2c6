use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::presence::DEFAULT_HEARTBEAT_TTL;
use crate::room::{RoomId, UserId};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2052";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub heartbeat_ttl: Duration,
    pub static_dir: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub dev_rooms: Vec<(RoomId, String)>,
    pub dev_users: Vec<(UserId, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_addr: SocketAddr = match parse_var("CHAT_BIND_ADDR", var("CHAT_BIND_ADDR"))? {
            Some(addr) => addr,
            None => DEFAULT_BIND_ADDR
                .parse()
                .map_err(|_| invalid("CHAT_BIND_ADDR", DEFAULT_BIND_ADDR))?,
        };

        let heartbeat_ttl = match parse_var::<u64>("CHAT_HEARTBEAT_TTL_SECS", var("CHAT_HEARTBEAT_TTL_SECS"))? {
            Some(0) => return Err(invalid("CHAT_HEARTBEAT_TTL_SECS", "0")),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_HEARTBEAT_TTL,
        };

        Ok(Config {
            bind_addr,
            redis_url: var("CHAT_REDIS_URL"),
            heartbeat_ttl,
            static_dir: var("CHAT_STATIC_DIR").map_or_else(|| PathBuf::from("public"), PathBuf::from),
            tls_cert: var("CHAT_TLS_CERT")
                .map_or_else(|| PathBuf::from("ssl/room/certificate.pem"), PathBuf::from),
            tls_key: var("CHAT_TLS_KEY").map_or_else(|| PathBuf::from("ssl/room/private.key"), PathBuf::from),
            dev_rooms: parse_pairs("CHAT_DEV_ROOMS", var("CHAT_DEV_ROOMS"))?,
            dev_users: parse_pairs("CHAT_DEV_USERS", var("CHAT_DEV_USERS"))?,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_file() && self.tls_key.is_file()
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| v.trim().parse().map_err(|_| invalid(name, &v)))
        .transpose()
}

/// Parses `"7:lobby,8:rust"` style lists.
fn parse_pairs<K: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
) -> Result<Vec<(K, String)>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, label) = entry.split_once(':').ok_or_else(|| invalid(name, entry))?;
            let id = id.parse().map_err(|_| invalid(name, entry))?;
            let label = label.trim();
            if label.is_empty() {
                return Err(invalid(name, entry));
            }
            Ok((id, label.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:2052".parse().unwrap());
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(70));
        assert_eq!(config.redis_url, None);
        assert_eq!(config.static_dir, PathBuf::from("public"));
        assert!(config.dev_rooms.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("CHAT_BIND_ADDR", "127.0.0.1:9000"),
            ("CHAT_HEARTBEAT_TTL_SECS", "30"),
            ("CHAT_REDIS_URL", "redis://127.0.0.1/"),
            ("CHAT_DEV_ROOMS", "7:lobby, 8:rust"),
            ("CHAT_DEV_USERS", "1:alice"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(30));
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(
            config.dev_rooms,
            vec![(RoomId(7), "lobby".to_string()), (RoomId(8), "rust".to_string())]
        );
        assert_eq!(config.dev_users, vec![(UserId(1), "alice".to_string())]);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config(&[("CHAT_HEARTBEAT_TTL_SECS", "0")]).is_err());
        assert!(config(&[("CHAT_HEARTBEAT_TTL_SECS", "soon")]).is_err());
        assert!(config(&[("CHAT_BIND_ADDR", "nowhere")]).is_err());
        assert!(config(&[("CHAT_DEV_USERS", "alice")]).is_err());
        assert!(config(&[("CHAT_DEV_ROOMS", "x:lobby")]).is_err());
        assert!(config(&[("CHAT_DEV_ROOMS", "7:")]).is_err());
    }
}
