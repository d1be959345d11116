use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::time::Duration;

use common_config::{env_override, parse_override, ServiceConfig};
use common_session::CosignConfig;
use serde::Deserialize;

use crate::tokens::Token;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    /// Unset defers to `LOG_LEVEL` and the build profile.
    pub log_level: Option<String>,
    /// How long in-flight requests may run once shutdown begins.
    pub shutdown_grace_secs: u64,
    pub tokens: Vec<Token>,
    pub cosign: CosignSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CosignSettings {
    pub daemon_address: String,
    pub service: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            log_level: None,
            shutdown_grace_secs: 5,
            tokens: Vec::new(),
            cosign: CosignSettings::default(),
        }
    }
}

impl Default for CosignSettings {
    fn default() -> Self {
        let defaults = CosignConfig::default();
        Self {
            daemon_address: defaults.daemon_address,
            service: defaults.service,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
        }
    }
}

impl GatewayConfig {
    /// Accepts IPv4 and IPv6 literals, the latter with or without brackets.
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let host = self
            .bind_address
            .trim_start_matches('[')
            .trim_end_matches(']');
        let ip: IpAddr = host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl CosignSettings {
    pub fn client_config(&self) -> CosignConfig {
        CosignConfig {
            daemon_address: self.daemon_address.clone(),
            service: self.service.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

impl ServiceConfig for GatewayConfig {
    const PREFIX: &'static str = "AUTH_GATEWAY_";

    fn apply_environment_overrides(&mut self, prefix: &str) {
        if let Some(bind_address) = env_override(prefix, "BIND_ADDRESS") {
            self.bind_address = bind_address;
        }
        if let Some(log_level) = env_override(prefix, "LOG_LEVEL") {
            self.log_level = Some(log_level);
        }
        self.port = parse_override(prefix, "PORT", self.port);
        self.shutdown_grace_secs =
            parse_override(prefix, "SHUTDOWN_GRACE_SECS", self.shutdown_grace_secs);
        if let Some(address) = env_override(prefix, "COSIGN_DAEMON_ADDRESS") {
            self.cosign.daemon_address = address;
        }
        if let Some(service) = env_override(prefix, "COSIGN_SERVICE") {
            self.cosign.service = service;
        }
    }
}
