use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::engine::RtpCodecCapability;
use crate::error::{AppError, Result};

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Media engine settings
    pub media: MediaConfig,
    /// Signaling channel settings
    pub signaling: SignalingConfig,
}

impl AppConfig {
    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        self.web.validate()?;
        self.media.validate()?;
        self.signaling.validate()?;
        Ok(())
    }
}

/// Web server configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
    /// Enable HTTPS
    pub https_enabled: bool,
    /// HTTPS port
    pub https_port: u16,
    /// Custom SSL certificate path
    pub ssl_cert_path: Option<String>,
    /// Custom SSL key path
    pub ssl_key_path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 3000,
            https_enabled: false,
            https_port: 3443,
            ssl_cert_path: None,
            ssl_key_path: None,
        }
    }
}

impl WebConfig {
    fn validate(&self) -> Result<()> {
        if self.bind_address.parse::<std::net::IpAddr>().is_err() {
            return Err(AppError::Config(format!(
                "invalid bind address: {}",
                self.bind_address
            )));
        }
        if self.ssl_cert_path.is_some() != self.ssl_key_path.is_some() {
            return Err(AppError::Config(
                "ssl_cert_path and ssl_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Media engine implementation
#[typeshare]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process engine that models transport negotiation without moving RTP
    #[default]
    Loopback,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Loopback => write!(f, "loopback"),
        }
    }
}

/// Media engine configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Engine implementation
    pub engine: EngineKind,
    /// IP the engine transports listen on
    pub listen_ip: String,
    /// Address advertised in ICE candidates (public IP behind NAT)
    pub announced_address: Option<String>,
    /// Lowest RTC port
    pub rtc_min_port: u16,
    /// Highest RTC port (inclusive)
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Router codec list
    pub codecs: Vec<RtpCodecCapability>,
    /// Delay before the process exits after the engine worker died
    pub worker_died_grace_ms: u64,
    /// Simulated DTLS handshake duration of the loopback engine
    pub loopback_handshake_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Loopback,
            listen_ip: "127.0.0.1".to_string(),
            announced_address: None,
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
            worker_died_grace_ms: 2000,
            loopback_handshake_ms: 0,
        }
    }
}

impl MediaConfig {
    fn validate(&self) -> Result<()> {
        if self.rtc_min_port == 0 || self.rtc_min_port > self.rtc_max_port {
            return Err(AppError::Config(format!(
                "invalid RTC port range {}-{}",
                self.rtc_min_port, self.rtc_max_port
            )));
        }
        if self.listen_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(AppError::Config(format!(
                "invalid listen ip: {}",
                self.listen_ip
            )));
        }
        if !self.enable_udp && !self.enable_tcp {
            return Err(AppError::Config(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }
        if self.codecs.iter().all(|c| c.is_rtx()) {
            return Err(AppError::Config("codec list is empty".to_string()));
        }
        Ok(())
    }
}

/// Signaling channel configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket ping interval, 0 disables
    pub heartbeat_secs: u64,
    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
    /// Create consumers paused; clients then send resume-consumer
    pub consume_paused: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            outbound_queue: 64,
            consume_paused: false,
        }
    }
}

impl SignalingConfig {
    fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            return Err(AppError::Config(
                "outbound_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.web.http_port, 3000);
        assert_eq!(config.media.rtc_min_port, 2000);
        assert_eq!(config.media.rtc_max_port, 2020);
        assert_eq!(config.media.codecs.len(), 2);
        assert_eq!(config.media.worker_died_grace_ms, 2000);
        assert!(!config.signaling.consume_paused);
    }

    #[test]
    fn test_invalid_port_range() {
        let mut config = AppConfig::default();
        config.media.rtc_min_port = 3000;
        config.media.rtc_max_port = 2000;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_empty_codecs_rejected() {
        let mut config = AppConfig::default();
        config.media.codecs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = AppConfig::default();
        config.signaling.outbound_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_paths_must_pair() {
        let mut config = AppConfig::default();
        config.web.ssl_cert_path = Some("/tmp/cert.pem".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [media]
            listen_ip = "10.0.0.5"
            announced_address = "203.0.113.7"

            [signaling]
            consume_paused = true
            "#,
        )
        .unwrap();
        assert_eq!(config.media.listen_ip, "10.0.0.5");
        assert_eq!(config.media.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.media.rtc_max_port, 2020);
        assert_eq!(config.web.http_port, 3000);
        assert!(config.signaling.consume_paused);
        assert_eq!(config.media.engine, EngineKind::Loopback);
    }
}
