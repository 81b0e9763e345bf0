//! # Configuration
//!
//! Typed configuration for the three workloads, loaded once at startup from
//! `TRUSTPLANE_*` environment variables and passed by reference from there
//! on. Configuration problems are fatal: binaries log the error and exit.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::identity::{validate_workload_id, TrustDomain};

/// Controller server certificate lifetime.
pub const CONTROLLER_CERT_TTL: Duration = Duration::from_secs(12 * 3600);

/// Default connector workload certificate lifetime; clamped to
/// [`CONNECTOR_CERT_TTL_MIN`], [`CONNECTOR_CERT_TTL_MAX`] when overridden.
pub const CONNECTOR_CERT_TTL: Duration = Duration::from_secs(3600);
pub const CONNECTOR_CERT_TTL_MIN: Duration = Duration::from_secs(300);
pub const CONNECTOR_CERT_TTL_MAX: Duration = Duration::from_secs(3600);

/// Tunneler workload certificate lifetime.
pub const TUNNELER_CERT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default lifetime of one-shot enrollment tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

const DEFAULT_GRPC_PORT: u16 = 8443;
const DEFAULT_ADMIN_PORT: u16 = 8080;
const DEFAULT_INBOUND_PORT: u16 = 9443;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind_address: String,
    pub grpc_port: u16,
    pub admin_port: u16,
    pub trust_domain: TrustDomain,
    /// Persisted CA location; when unset a fresh CA is generated in memory
    /// at startup.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub ca_common_name: String,
    pub ca_ttl: Duration,
    /// Bearer token protecting the admin HTTP API.
    pub admin_token: String,
    /// Shared secret for `/api/internal/consume-token`; defaults to the
    /// admin token.
    pub internal_token: String,
    pub token_ttl: Duration,
    pub token_store_path: Option<PathBuf>,
    /// When true, tokens stay valid for multiple enrollments until expiry.
    pub token_reuse: bool,
    pub connector_cert_ttl: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let trust_domain = TrustDomain::parse(&require_env("TRUSTPLANE_TRUST_DOMAIN")?)?;
        let admin_token = require_env("TRUSTPLANE_ADMIN_TOKEN")?;
        let internal_token =
            optional_env("TRUSTPLANE_INTERNAL_TOKEN").unwrap_or_else(|| admin_token.clone());

        let connector_cert_ttl = optional_env("TRUSTPLANE_CONNECTOR_CERT_TTL_SECS")
            .map(|raw| parse_secs("TRUSTPLANE_CONNECTOR_CERT_TTL_SECS", &raw))
            .transpose()?
            .unwrap_or(CONNECTOR_CERT_TTL)
            .clamp(CONNECTOR_CERT_TTL_MIN, CONNECTOR_CERT_TTL_MAX);

        let config = Self {
            bind_address: optional_env("TRUSTPLANE_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            grpc_port: parse_port("TRUSTPLANE_GRPC_PORT", DEFAULT_GRPC_PORT)?,
            admin_port: parse_port("TRUSTPLANE_ADMIN_PORT", DEFAULT_ADMIN_PORT)?,
            trust_domain,
            ca_cert_path: optional_env("TRUSTPLANE_CA_CERT_PATH").map(PathBuf::from),
            ca_key_path: optional_env("TRUSTPLANE_CA_KEY_PATH").map(PathBuf::from),
            ca_common_name: optional_env("TRUSTPLANE_CA_COMMON_NAME")
                .unwrap_or_else(|| "trustplane internal ca".to_string()),
            ca_ttl: optional_env("TRUSTPLANE_CA_TTL_SECS")
                .map(|raw| parse_secs("TRUSTPLANE_CA_TTL_SECS", &raw))
                .transpose()?
                .unwrap_or(Duration::from_secs(10 * 365 * 24 * 3600)),
            admin_token,
            internal_token,
            token_ttl: optional_env("TRUSTPLANE_TOKEN_TTL_SECS")
                .map(|raw| parse_secs("TRUSTPLANE_TOKEN_TTL_SECS", &raw))
                .transpose()?
                .unwrap_or(DEFAULT_TOKEN_TTL),
            token_store_path: optional_env("TRUSTPLANE_TOKEN_STORE_PATH").map(PathBuf::from),
            token_reuse: bool_env("TRUSTPLANE_TOKEN_REUSE"),
            connector_cert_ttl,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grpc_port == self.admin_port {
            return Err(Error::validation("gRPC and admin ports cannot be the same"));
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(Error::validation(
                "TRUSTPLANE_CA_CERT_PATH and TRUSTPLANE_CA_KEY_PATH must be set together",
            ));
        }
        if self.admin_token.len() < 16 {
            return Err(Error::validation("admin token must be at least 16 characters"));
        }
        if self.token_ttl.is_zero() {
            return Err(Error::validation("token ttl must be positive"));
        }
        Ok(())
    }

    pub fn grpc_bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.grpc_port)
    }

    pub fn admin_bind_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.admin_port)
    }
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub controller_addr: String,
    pub id: String,
    pub trust_domain: TrustDomain,
    /// Pinned controller CA, PEM.
    pub controller_ca: String,
    pub enrollment_token: String,
    /// Advertised private address; detected from the route to the controller
    /// when not overridden.
    pub private_ip: Option<IpAddr>,
    pub inbound_port: u16,
    pub version: String,
}

impl ConnectorConfig {
    pub fn from_env() -> Result<Self> {
        let id = require_env("TRUSTPLANE_ID")?;
        validate_workload_id(&id)?;

        let config = Self {
            controller_addr: require_addr("TRUSTPLANE_CONTROLLER_ADDR")?,
            id,
            trust_domain: TrustDomain::parse(&require_env("TRUSTPLANE_TRUST_DOMAIN")?)?,
            controller_ca: load_controller_ca()?,
            enrollment_token: require_env("TRUSTPLANE_ENROLLMENT_TOKEN")?,
            private_ip: optional_env("TRUSTPLANE_PRIVATE_IP")
                .map(|raw| {
                    raw.parse().map_err(|_| {
                        Error::validation_field(
                            format!("'{}' is not a valid IP address", raw),
                            "private_ip",
                        )
                    })
                })
                .transpose()?,
            inbound_port: parse_port("TRUSTPLANE_INBOUND_PORT", DEFAULT_INBOUND_PORT)?,
            version: optional_env("TRUSTPLANE_VERSION")
                .unwrap_or_else(|| crate::VERSION.to_string()),
        };
        Ok(config)
    }

    pub fn inbound_bind_address(&self) -> String {
        match self.private_ip {
            Some(ip) => format!("{}:{}", ip, self.inbound_port),
            None => format!("0.0.0.0:{}", self.inbound_port),
        }
    }
}

/// Tunneler configuration.
#[derive(Debug, Clone)]
pub struct TunnelerConfig {
    /// Controller address, used for enrollment and renewal.
    pub controller_addr: String,
    /// Connector address, used for the control stream.
    pub connector_addr: String,
    pub id: String,
    pub trust_domain: TrustDomain,
    pub controller_ca: String,
    pub enrollment_token: String,
}

impl TunnelerConfig {
    pub fn from_env() -> Result<Self> {
        let id = require_env("TRUSTPLANE_ID")?;
        validate_workload_id(&id)?;

        Ok(Self {
            controller_addr: require_addr("TRUSTPLANE_CONTROLLER_ADDR")?,
            connector_addr: require_addr("TRUSTPLANE_CONNECTOR_ADDR")?,
            id,
            trust_domain: TrustDomain::parse(&require_env("TRUSTPLANE_TRUST_DOMAIN")?)?,
            controller_ca: load_controller_ca()?,
            enrollment_token: require_env("TRUSTPLANE_ENROLLMENT_TOKEN")?,
        })
    }
}

/// Read the pinned controller CA from `TRUSTPLANE_CONTROLLER_CA` (inline PEM)
/// or `TRUSTPLANE_CONTROLLER_CA_PATH` (file).
fn load_controller_ca() -> Result<String> {
    if let Some(pem) = optional_env("TRUSTPLANE_CONTROLLER_CA") {
        return Ok(pem);
    }
    if let Some(path) = optional_env("TRUSTPLANE_CONTROLLER_CA_PATH") {
        return std::fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("failed to read controller CA from '{}': {}", path, e))
        });
    }
    Err(Error::config(
        "either TRUSTPLANE_CONTROLLER_CA or TRUSTPLANE_CONTROLLER_CA_PATH must be set",
    ))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    optional_env(name).ok_or_else(|| Error::config(format!("{} must be set", name)))
}

fn require_addr(name: &str) -> Result<String> {
    let addr = require_env(name)?;
    if !addr.contains(':') {
        return Err(Error::config(format!("{} must be host:port, got '{}'", name, addr)));
    }
    Ok(addr)
}

fn bool_env(name: &str) -> bool {
    optional_env(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn parse_port(name: &str, default: u16) -> Result<u16> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| Error::config(format!("{} must be a non-zero port, got '{}'", name, raw))),
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::config(format!("{} must be a positive number of seconds", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_controller_config() -> ControllerConfig {
        ControllerConfig {
            bind_address: "0.0.0.0".into(),
            grpc_port: DEFAULT_GRPC_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            trust_domain: TrustDomain::parse("mycorp.internal").unwrap(),
            ca_cert_path: None,
            ca_key_path: None,
            ca_common_name: "trustplane internal ca".into(),
            ca_ttl: Duration::from_secs(3600),
            admin_token: "0123456789abcdef".into(),
            internal_token: "0123456789abcdef".into(),
            token_ttl: DEFAULT_TOKEN_TTL,
            token_store_path: None,
            token_reuse: false,
            connector_cert_ttl: CONNECTOR_CERT_TTL,
        }
    }

    #[test]
    fn controller_config_validates() {
        assert!(base_controller_config().validate().is_ok());
    }

    #[test]
    fn controller_config_rejects_port_clash() {
        let mut config = base_controller_config();
        config.admin_port = config.grpc_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn controller_config_rejects_half_configured_ca() {
        let mut config = base_controller_config();
        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn controller_config_rejects_short_admin_token() {
        let mut config = base_controller_config();
        config.admin_token = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bind_addresses_are_formatted() {
        let config = base_controller_config();
        assert_eq!(config.grpc_bind_address(), "0.0.0.0:8443");
        assert_eq!(config.admin_bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn parse_secs_rejects_zero_and_garbage() {
        assert!(parse_secs("X", "0").is_err());
        assert!(parse_secs("X", "ten").is_err());
        assert_eq!(parse_secs("X", "600").unwrap(), Duration::from_secs(600));
    }
}
