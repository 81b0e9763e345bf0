//! # Trustplane
//!
//! Trustplane is a zero-trust identity and control plane for a three-tier
//! fleet: a central **controller** acting as internal certificate authority
//! and policy broker, **connectors** anchoring workload networks, and
//! **tunnelers** attaching to connectors. All control-plane traffic is
//! mutually authenticated TLS 1.3 with short-lived certificates bound to
//! SPIFFE workload identities under a single trust domain.
//!
//! ## Architecture
//!
//! ```text
//! Tunneler ──mTLS──▶ Connector ──mTLS──▶ Controller (CA + policy)
//!     ▲                  ▲                    │
//!     └── heartbeats ────┴── allowlist ◀──────┘
//! ```
//!
//! ## Core Components
//!
//! - **Identity**: SPIFFE URIs, the rcgen-backed internal CA, and the
//!   rotating certificate store that makes renewal a hot swap
//! - **Enrollment**: one-time bootstrap tokens exchanged for workload
//!   certificates; renewal bound to the caller's mTLS identity
//! - **Control plane**: a tonic bidirectional stream carrying heartbeats up
//!   and allowlist state down
//! - **Admin API**: an axum surface for minting tokens and reading presence

pub mod agent;
pub mod config;
pub mod connector;
pub mod control;
pub mod controller;
pub mod errors;
pub mod identity;
pub mod observability;
pub mod proto;
pub mod tls;
pub mod tunneler;

// Re-export commonly used types and traits
pub use errors::{Error, Result, TrustplaneError};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
