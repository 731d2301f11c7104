use serde::Deserialize;
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport settings a [`crate::Builder`] can be configured from.
///
/// Loading them is left to the caller, any serde format works:
///
/// ```rust
/// use gantry::ServerSettings;
///
/// let settings: ServerSettings = serde_json::from_str(r#"{"grpc_port": 50051, "http_port": 8080}"#).unwrap();
/// assert_eq!(settings.grpc_port, Some(50051));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: IpAddr,
    pub grpc_port: Option<u16>,
    pub http_port: Option<u16>,
    /// Seconds to wait for in-flight connections on shutdown
    pub shutdown_timeout: u64,
}

impl ServerSettings {
    #[inline]
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            grpc_port: None,
            http_port: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}
