//! Workload identity model.
//!
//! Every workload in the fleet is identified by a SPIFFE URI of the form
//! `spiffe://{trust_domain}/{role}/{id}` carried as the sole URI SAN of its
//! certificate. This module owns the parsing and validation rules for trust
//! domains, roles, and workload ids; certificate-level concerns live in the
//! sibling modules.

pub mod ca;
pub mod leaf;
pub mod store;

pub use ca::CertificateAuthority;
pub use leaf::ParsedLeaf;
pub use store::CertificateStore;

use std::fmt;
use std::str::FromStr;

use crate::errors::{AuthErrorType, Error, Result};

/// Maximum length of a workload id.
const MAX_ID_LEN: usize = 128;

/// A SPIFFE trust domain: a bare DNS-like name without scheme, path, or
/// trailing dot (e.g. `mycorp.internal`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Normalize and validate a trust domain string.
    ///
    /// Normalization strips surrounding whitespace and a single trailing dot.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let normalized = trimmed.strip_suffix('.').unwrap_or(trimmed);

        if normalized.is_empty() {
            return Err(Error::validation_field("trust domain must not be empty", "trust_domain"));
        }
        if normalized.contains("://") {
            return Err(Error::validation_field(
                "trust domain must not carry a scheme",
                "trust_domain",
            ));
        }
        if normalized.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(Error::validation_field(
                format!("trust domain '{}' contains invalid characters", normalized),
                "trust_domain",
            ));
        }

        Ok(Self(normalized.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three workload roles recognized by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadRole {
    Controller,
    Connector,
    Tunneler,
}

impl WorkloadRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadRole::Controller => "controller",
            WorkloadRole::Connector => "connector",
            WorkloadRole::Tunneler => "tunneler",
        }
    }
}

impl fmt::Display for WorkloadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "controller" => Ok(WorkloadRole::Controller),
            "connector" => Ok(WorkloadRole::Connector),
            "tunneler" => Ok(WorkloadRole::Tunneler),
            other => Err(Error::auth(
                format!("unknown workload role '{}'", other),
                AuthErrorType::UnknownRole,
            )),
        }
    }
}

/// Validate a workload id: `[A-Za-z0-9._-]{1,128}`.
pub fn validate_workload_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::validation_field(
            format!("workload id must be 1-{} characters", MAX_ID_LEN),
            "id",
        ));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(Error::validation_field(
            format!("workload id '{}' contains invalid characters", id),
            "id",
        ));
    }
    Ok(())
}

/// A fully validated SPIFFE workload identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    pub trust_domain: TrustDomain,
    pub role: WorkloadRole,
    pub id: String,
}

impl SpiffeId {
    pub fn new(trust_domain: TrustDomain, role: WorkloadRole, id: &str) -> Result<Self> {
        validate_workload_id(id)?;
        Ok(Self { trust_domain, role, id: id.to_string() })
    }

    /// Parse a SPIFFE URI. The path must consist of exactly two non-empty
    /// segments: the role and the workload id.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("spiffe://")
            .ok_or_else(|| Error::validation(format!("'{}' is not a spiffe URI", uri)))?;

        let (host, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("spiffe URI '{}' has no path", uri)))?;

        let trust_domain = TrustDomain::parse(host)?;

        let segments: Vec<&str> = path.split('/').collect();
        match segments.as_slice() {
            &[role, id] if !role.is_empty() && !id.is_empty() => {
                let role = WorkloadRole::from_str(role)?;
                Self::new(trust_domain, role, id)
            }
            _ => Err(Error::validation(format!(
                "spiffe URI path must be exactly /<role>/<id>, got '{}'",
                uri
            ))),
        }
    }

    /// Render the canonical URI form.
    pub fn uri(&self) -> String {
        format!("spiffe://{}/{}/{}", self.trust_domain, self.role, self.id)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}
