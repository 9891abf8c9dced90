use protocol::DEFAULT_LOG_CAPACITY;
use rand::Rng;
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};
use toml_config::TomlConfig;

#[derive(Deserialize, Debug, Default)]
pub struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    broadcast_port: Option<u16>,
    client_group: Option<SocketAddrV4>,
    nickname: Option<String>,
    connect_timeout: Option<u64>,
    listen_timeout: Option<u64>,
    discovery_attempts: Option<u32>,
    discovery_timeout: Option<u64>,
    log_capacity: Option<usize>,
}

/// Client configuration, durations are given in milliseconds in the file
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the servers reach us at. Resolved from the outbound interface when unset.
    pub host: Option<String>,
    /// Port of our unicast listener, 0 picks a free one
    pub port: u16,
    pub broadcast_port: u16,
    pub client_group: SocketAddrV4,
    pub nickname: String,
    pub connect_timeout: Duration,
    pub listen_timeout: Duration,
    pub discovery_attempts: u32,
    pub discovery_timeout: Duration,
    pub log_capacity: usize,
}

/// Nickname for clients that didn't pick one
#[must_use]
pub fn guest_nickname() -> String {
    let mut rng = rand::thread_rng();
    format!("guest-{:04}", rng.gen_range(0..10_000))
}

impl From<ConfigFile> for Config {
    fn from(
        ConfigFile {
            host,
            port,
            broadcast_port,
            client_group,
            nickname,
            connect_timeout,
            listen_timeout,
            discovery_attempts,
            discovery_timeout,
            log_capacity,
        }: ConfigFile,
    ) -> Self {
        let default = Config::default();
        let millis = |value: Option<u64>, default| value.map_or(default, Duration::from_millis);
        Self {
            host,
            port: port.unwrap_or(default.port),
            broadcast_port: broadcast_port.unwrap_or(default.broadcast_port),
            client_group: client_group.unwrap_or(default.client_group),
            nickname: nickname
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(default.nickname),
            connect_timeout: millis(connect_timeout, default.connect_timeout),
            listen_timeout: millis(listen_timeout, default.listen_timeout),
            discovery_attempts: discovery_attempts.unwrap_or(default.discovery_attempts),
            discovery_timeout: millis(discovery_timeout, default.discovery_timeout),
            log_capacity: log_capacity.unwrap_or(default.log_capacity),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            broadcast_port: 10002,
            client_group: SocketAddrV4::new(Ipv4Addr::new(224, 1, 1, 2), 10004),
            nickname: guest_nickname(),
            connect_timeout: Duration::from_secs(1),
            listen_timeout: Duration::from_secs(2),
            discovery_attempts: 5,
            discovery_timeout: Duration::from_secs(1),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl TomlConfig<ConfigFile> for Config {}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn empty_file_gets_a_guest_nickname() {
        let config = Config::parse_toml(Path::new("config.toml"), "").unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.broadcast_port, 10002);
        assert_eq!(config.client_group.port(), 10004);
        let number = config.nickname.strip_prefix("guest-").unwrap();
        assert_eq!(number.len(), 4);
        assert!(number.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn blank_nickname_is_replaced() {
        let config = Config::parse_toml(Path::new("config.toml"), "nickname = \"  \"").unwrap();
        assert!(config.nickname.starts_with("guest-"));
    }

    #[test]
    fn configured_values_are_kept() {
        let toml = r#"
            host = "192.168.0.20"
            port = 20000
            nickname = "ada"
            client_group = "239.0.0.2:20004"
            connect_timeout = 300
            discovery_attempts = 2
        "#;
        let config = Config::parse_toml(Path::new("config.toml"), toml).unwrap();
        assert_eq!(config.host.as_deref(), Some("192.168.0.20"));
        assert_eq!(config.port, 20000);
        assert_eq!(config.nickname, "ada");
        assert_eq!(config.client_group, "239.0.0.2:20004".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_millis(300));
        assert_eq!(config.discovery_attempts, 2);
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
    }
}
