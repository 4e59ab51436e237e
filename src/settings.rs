//! Client configuration.

use std::{fmt, time::Duration};

use crate::errors::Error;

/// A login and password pair presented to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    login: String,
    password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self { login: login.into(), password: password.into() }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the password
        f.debug_struct("Credentials").field("login", &self.login).finish_non_exhaustive()
    }
}

/// Raw socket knobs applied to every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSettings {
    pub keep_alive: Option<Duration>,
    pub no_delay: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(60)),
            no_delay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            connect_timeout: Duration::from_secs(3),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// TLS knobs; only honored when the `tls` cargo feature is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslSettings {
    pub enabled: bool,
    pub validate_server_cert: bool,
    /// Overrides the hostname presented for certificate validation.
    pub expected_common_name: Option<String>,
}

impl Default for SslSettings {
    fn default() -> Self {
        Self { enabled: false, validate_server_cert: true, expected_common_name: None }
    }
}

/// Address of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub secure_port: Option<u16>,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, secure_port: None }
    }

    pub fn with_secure_port(mut self, port: u16) -> Self {
        self.secure_port = Some(port);
        self
    }
}

/// Cluster discovery configuration: a DNS name or explicit gossip seeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSettings {
    /// DNS name resolving to the gossip seeds.
    pub dns: Option<String>,
    /// Explicit gossip seeds; `port` is the gossip HTTP port.
    pub seeds: Vec<NodeAddress>,
    /// Gossip port used together with `dns`.
    pub gossip_port: u16,
    pub max_discover_attempts: i32,
    pub gossip_timeout: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            dns: None,
            seeds: Vec::new(),
            gossip_port: 2113,
            max_discover_attempts: 10,
            gossip_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Static(NodeAddress),
    Cluster(ClusterSettings),
}

/// All knobs recognized by the client. Build through [`Settings::builder`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub operation_timeout: Duration,
    pub operation_timeout_check_interval: Duration,
    pub reconnection_delay: Duration,
    /// Negative means unbounded.
    pub max_reconnections: i32,
    /// Negative means unbounded.
    pub max_operation_retries: i32,
    pub max_operation_queue_size: usize,
    pub max_concurrent_operations: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub require_master: bool,
    pub tcp: TcpSettings,
    pub ssl: SslSettings,
    pub default_credentials: Option<Credentials>,
    pub(crate) target: Target,
}

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }
}

/// Fluent builder for [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    operation_timeout: Option<Duration>,
    operation_timeout_check_interval: Option<Duration>,
    reconnection_delay: Option<Duration>,
    max_reconnections: Option<i32>,
    max_operation_retries: Option<i32>,
    max_operation_queue_size: Option<usize>,
    max_concurrent_operations: Option<usize>,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    require_master: Option<bool>,
    tcp: Option<TcpSettings>,
    ssl: Option<SslSettings>,
    default_credentials: Option<Credentials>,
    target: Option<Target>,
}

impl SettingsBuilder {
    /// Connect to a single, statically configured node.
    pub fn single_node(mut self, host: impl Into<String>, port: u16) -> Self {
        self.target = Some(Target::Static(NodeAddress::new(host, port)));
        self
    }

    /// Connect to a single node described by a full [`NodeAddress`].
    pub fn node(mut self, address: NodeAddress) -> Self {
        self.target = Some(Target::Static(address));
        self
    }

    /// Discover nodes through cluster gossip.
    pub fn cluster(mut self, cluster: ClusterSettings) -> Self {
        self.target = Some(Target::Cluster(cluster));
        self
    }

    pub fn operation_timeout(mut self, d: Duration) -> Self {
        self.operation_timeout = Some(d);
        self
    }

    pub fn operation_timeout_check_interval(mut self, d: Duration) -> Self {
        self.operation_timeout_check_interval = Some(d);
        self
    }

    pub fn reconnection_delay(mut self, d: Duration) -> Self {
        self.reconnection_delay = Some(d);
        self
    }

    /// Number of reconnection attempts before the client gives up; negative
    /// means never give up.
    pub fn max_reconnections(mut self, n: i32) -> Self {
        self.max_reconnections = Some(n);
        self
    }

    pub fn max_operation_retries(mut self, n: i32) -> Self {
        self.max_operation_retries = Some(n);
        self
    }

    pub fn max_operation_queue_size(mut self, n: usize) -> Self {
        self.max_operation_queue_size = Some(n);
        self
    }

    pub fn max_concurrent_operations(mut self, n: usize) -> Self {
        self.max_concurrent_operations = Some(n);
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = Some(d);
        self
    }

    pub fn heartbeat_timeout(mut self, d: Duration) -> Self {
        self.heartbeat_timeout = Some(d);
        self
    }

    pub fn require_master(mut self, v: bool) -> Self {
        self.require_master = Some(v);
        self
    }

    pub fn tcp(mut self, tcp: TcpSettings) -> Self {
        self.tcp = Some(tcp);
        self
    }

    pub fn ssl(mut self, ssl: SslSettings) -> Self {
        self.ssl = Some(ssl);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.default_credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<Settings, Error> {
        let target = self
            .target
            .ok_or_else(|| Error::InvalidArgument("no node or cluster configured".into()))?;

        if let Some(creds) = &self.default_credentials {
            if creds.login().len() > 255 || creds.password().len() > 255 {
                return Err(Error::InvalidArgument(
                    "credential fields are limited to 255 bytes".into(),
                ))
            }
        }

        if let Target::Cluster(cluster) = &target {
            if cluster.dns.is_none() && cluster.seeds.is_empty() {
                return Err(Error::InvalidArgument(
                    "cluster discovery needs a DNS name or at least one gossip seed".into(),
                ))
            }
        }

        let ssl = self.ssl.unwrap_or_default();
        if ssl.enabled && !cfg!(feature = "tls") {
            return Err(Error::InvalidArgument(
                "ssl is enabled but the client was built without the `tls` feature".into(),
            ))
        }

        let max_operation_queue_size = self.max_operation_queue_size.unwrap_or(65_536).max(1);
        let max_concurrent_operations = self.max_concurrent_operations.unwrap_or(5_000).max(1);

        Ok(Settings {
            operation_timeout: self.operation_timeout.unwrap_or(Duration::from_secs(7)),
            operation_timeout_check_interval: self
                .operation_timeout_check_interval
                .unwrap_or(Duration::from_secs(1)),
            reconnection_delay: self.reconnection_delay.unwrap_or(Duration::from_millis(500)),
            max_reconnections: self.max_reconnections.unwrap_or(10),
            max_operation_retries: self.max_operation_retries.unwrap_or(10),
            max_operation_queue_size,
            max_concurrent_operations,
            heartbeat_interval: self.heartbeat_interval.unwrap_or(Duration::from_millis(500)),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_millis(1_500)),
            require_master: self.require_master.unwrap_or(true),
            tcp: self.tcp.unwrap_or_default(),
            ssl,
            default_credentials: self.default_credentials,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let settings = Settings::builder().single_node("localhost", 1113).build().unwrap();
        assert_eq!(settings.operation_timeout, Duration::from_secs(7));
        assert_eq!(settings.max_reconnections, 10);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(500));
        assert!(settings.require_master);
        assert!(settings.tcp.no_delay);
    }

    #[test]
    fn builder_requires_a_target() {
        assert!(matches!(Settings::builder().build(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn builder_rejects_oversize_credentials() {
        let result = Settings::builder()
            .single_node("localhost", 1113)
            .with_credentials(Credentials::new("a".repeat(300), "pw"))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn builder_rejects_an_empty_cluster() {
        let result = Settings::builder().cluster(ClusterSettings::default()).build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn credentials_debug_hides_the_password() {
        let debug = format!("{:?}", Credentials::new("ops", "hunter2"));
        assert!(debug.contains("ops"));
        assert!(!debug.contains("hunter2"));
    }
}
