//! Rotating certificate store.
//!
//! Holds the workload's currently active certificate and private key in the
//! form rustls consumes during handshakes. The store is installed as both the
//! server-side and client-side certificate resolver, so every new handshake
//! picks up the newest identity while established sessions keep running on
//! the one they negotiated. `install` swaps the whole state atomically.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rustls::client::ResolvesClientCert;
use rustls::crypto::ring::sign::any_ecdsa_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;

use crate::errors::{Error, Result};
use crate::identity::leaf::ParsedLeaf;

/// The currently active workload identity.
pub struct ActiveIdentity {
    certified: Arc<CertifiedKey>,
    pub chain_pem: String,
    pub spiffe_uri: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for ActiveIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveIdentity")
            .field("spiffe_uri", &self.spiffe_uri)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Single-writer/many-reader store for the active certificate.
#[derive(Debug, Default)]
pub struct CertificateStore {
    current: RwLock<Option<Arc<ActiveIdentity>>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and atomically install a new certificate chain and private key.
    ///
    /// The leaf is validated on the way in (exactly one `spiffe://` URI SAN,
    /// not a CA) so a malformed issuance can never become the active
    /// identity.
    pub fn install(&self, chain_pem: &str, key_pem: &str) -> Result<Arc<ActiveIdentity>> {
        let parsed = ParsedLeaf::from_pem(chain_pem)?;

        let chain: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(
            chain_pem.as_bytes(),
        )
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::certificate(format!("invalid certificate chain PEM: {:?}", e)))?;
        if chain.is_empty() {
            return Err(Error::certificate("certificate chain PEM contains no certificates"));
        }

        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| Error::certificate(format!("invalid private key PEM: {:?}", e)))?;
        let signing_key = any_ecdsa_type(&key)
            .map_err(|e| Error::certificate_with_source("unusable private key", Box::new(e)))?;

        let identity = Arc::new(ActiveIdentity {
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
            chain_pem: chain_pem.to_string(),
            spiffe_uri: parsed.spiffe_uri,
            not_before: parsed.not_before,
            not_after: parsed.not_after,
        });

        let mut guard = self.current.write().expect("certificate store lock poisoned");
        *guard = Some(identity.clone());
        Ok(identity)
    }

    /// Snapshot of the active identity, if one has been installed.
    pub fn current(&self) -> Option<Arc<ActiveIdentity>> {
        self.current.read().expect("certificate store lock poisoned").clone()
    }

    /// Expiry of the active certificate.
    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.current().map(|identity| identity.not_after)
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.current().map(|identity| identity.certified.clone())
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl ResolvesClientCert for CertificateStore {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        self.current().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ca::{generate_key_pair, CertificateAuthority};
    use std::time::Duration;

    fn issue(ca: &CertificateAuthority, uri: &str) -> (String, String) {
        let key = generate_key_pair().unwrap();
        let cert = ca
            .issue_workload_cert(uri, &key.public_key_pem(), Duration::from_secs(1800), &[], &[])
            .unwrap();
        (cert, key.serialize_pem())
    }

    fn test_ca() -> CertificateAuthority {
        let (cert, key) =
            CertificateAuthority::generate_self_signed("store test ca", Duration::from_secs(3600))
                .unwrap();
        CertificateAuthority::load(&cert, &key).unwrap()
    }

    #[test]
    fn empty_store_resolves_nothing() {
        let store = CertificateStore::new();
        assert!(store.current().is_none());
        assert!(store.not_after().is_none());
        assert!(!ResolvesClientCert::has_certs(&store));
    }

    #[test]
    fn install_swaps_identity() {
        let ca = test_ca();
        let store = CertificateStore::new();

        let (cert1, key1) = issue(&ca, "spiffe://mycorp.internal/connector/c1");
        let first = store.install(&cert1, &key1).unwrap();
        assert_eq!(first.spiffe_uri, "spiffe://mycorp.internal/connector/c1");
        assert!(ResolvesClientCert::has_certs(&store));
        let first_expiry = store.not_after().unwrap();

        let (cert2, key2) = issue(&ca, "spiffe://mycorp.internal/connector/c1");
        let second = store.install(&cert2, &key2).unwrap();
        assert_eq!(second.spiffe_uri, first.spiffe_uri);
        assert_ne!(first.chain_pem, second.chain_pem);
        assert!(store.not_after().unwrap() >= first_expiry);

        // A snapshot taken before the swap still reads its own certificate.
        assert_eq!(first.spiffe_uri, "spiffe://mycorp.internal/connector/c1");
    }

    #[test]
    fn install_rejects_mismatched_pems() {
        let store = CertificateStore::new();
        assert!(store.install("not a pem", "still not a pem").is_err());
    }
}
