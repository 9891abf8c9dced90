//! # Server Configuration and TOML File Loading
//!
//! This module contains the server configuration structure. Loading goes through
//! [`toml_config::TomlConfig`], every field but `port` may be left out of the file.

use crate::election::ElectionRule;
use protocol::DEFAULT_LOG_CAPACITY;
use serde::Deserialize;
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    num::NonZero,
    time::Duration,
};
use toml_config::TomlConfig;

#[derive(Deserialize, Debug)]
pub struct ConfigFile {
    host: Option<String>,
    port: u16,
    broadcast_port: Option<u16>,
    server_group: Option<SocketAddrV4>,
    client_group: Option<SocketAddrV4>,
    heartbeat_interval: Option<u64>,
    heartbeat_threshold: Option<u32>,
    connect_timeout: Option<u64>,
    ack_window: Option<u64>,
    listen_timeout: Option<u64>,
    discovery_attempts: Option<u32>,
    discovery_timeout: Option<u64>,
    log_capacity: Option<usize>,
    election_rule: Option<ElectionRule>,
    thread_count: Option<NonZero<usize>>,
}

/// Server configuration
///
/// Use [`TomlConfig::load_toml_file`] to initialize. Durations are given in milliseconds
/// in the file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host other nodes reach us at. Resolved from the outbound interface when unset.
    pub host: Option<String>,
    /// Unicast listener port, 0 picks a free one
    pub port: u16,
    pub broadcast_port: u16,
    pub server_group: SocketAddrV4,
    pub client_group: SocketAddrV4,
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before the neighbor is considered failed
    pub heartbeat_threshold: u32,
    pub connect_timeout: Duration,
    pub ack_window: Duration,
    pub listen_timeout: Duration,
    pub discovery_attempts: u32,
    pub discovery_timeout: Duration,
    pub log_capacity: usize,
    pub election_rule: ElectionRule,
    pub thread_count: NonZero<usize>,
}

pub const DEFAULT_PORT: u16 = 10001;
pub const DEFAULT_BROADCAST_PORT: u16 = 10002;
pub const DEFAULT_SERVER_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 1, 1, 1), 10003);
pub const DEFAULT_CLIENT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 1, 1, 2), 10004);

impl From<ConfigFile> for Config {
    fn from(
        ConfigFile {
            host,
            port,
            broadcast_port,
            server_group,
            client_group,
            heartbeat_interval,
            heartbeat_threshold,
            connect_timeout,
            ack_window,
            listen_timeout,
            discovery_attempts,
            discovery_timeout,
            log_capacity,
            election_rule,
            thread_count,
        }: ConfigFile,
    ) -> Self {
        let default = Config::default();
        let millis = |value: Option<u64>, default| value.map_or(default, Duration::from_millis);
        Self {
            host,
            port,
            broadcast_port: broadcast_port.unwrap_or(default.broadcast_port),
            server_group: server_group.unwrap_or(default.server_group),
            client_group: client_group.unwrap_or(default.client_group),
            heartbeat_interval: millis(heartbeat_interval, default.heartbeat_interval),
            heartbeat_threshold: heartbeat_threshold.unwrap_or(default.heartbeat_threshold),
            connect_timeout: millis(connect_timeout, default.connect_timeout),
            ack_window: millis(ack_window, default.ack_window),
            listen_timeout: millis(listen_timeout, default.listen_timeout),
            discovery_attempts: discovery_attempts.unwrap_or(default.discovery_attempts),
            discovery_timeout: millis(discovery_timeout, default.discovery_timeout),
            log_capacity: log_capacity.unwrap_or(default.log_capacity),
            election_rule: election_rule.unwrap_or(default.election_rule),
            thread_count: thread_count.unwrap_or(default.thread_count),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_group: DEFAULT_SERVER_GROUP,
            client_group: DEFAULT_CLIENT_GROUP,
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_threshold: 5,
            connect_timeout: Duration::from_secs(1),
            ack_window: Duration::from_millis(200),
            listen_timeout: Duration::from_secs(2),
            discovery_attempts: 5,
            discovery_timeout: Duration::from_secs(1),
            log_capacity: DEFAULT_LOG_CAPACITY,
            election_rule: ElectionRule::Max,
            thread_count: NonZero::<usize>::MIN.saturating_add(3),
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
    fn minimal_file_falls_back_to_defaults() {
        let config = Config::parse_toml(Path::new("config.toml"), "port = 12000").unwrap();
        assert_eq!(config.port, 12000);
        assert_eq!(config.heartbeat_threshold, 5);
        assert_eq!(config.log_capacity, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.server_group, DEFAULT_SERVER_GROUP);
        assert_eq!(config.election_rule, ElectionRule::Max);
        assert_eq!(config.thread_count.get(), 4);
    }

    #[test]
    fn full_file() {
        let toml = r#"
            host = "192.168.0.10"
            port = 10001
            broadcast_port = 20002
            server_group = "239.0.0.1:20003"
            client_group = "239.0.0.2:20004"
            heartbeat_interval = 500
            heartbeat_threshold = 3
            connect_timeout = 250
            ack_window = 100
            listen_timeout = 1000
            discovery_attempts = 2
            discovery_timeout = 300
            log_capacity = 16
            election_rule = "min"
            thread_count = 2
        "#;
        let config = Config::parse_toml(Path::new("config.toml"), toml).unwrap();
        assert_eq!(config.host.as_deref(), Some("192.168.0.10"));
        assert_eq!(config.broadcast_port, 20002);
        assert_eq!(config.client_group, "239.0.0.2:20004".parse().unwrap());
        assert_eq!(config.heartbeat_threshold, 3);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.election_rule, ElectionRule::Min);
        assert_eq!(config.thread_count.get(), 2);
    }
}
