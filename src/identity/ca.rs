//! Internal certificate authority.
//!
//! The controller owns a single self-signed P-256 CA and mints short-lived
//! workload leaves from it. Issuance takes only the subject's public key;
//! private keys are generated by the workloads themselves and never cross the
//! wire. Authorization (token checks, identity equality) is the caller's
//! responsibility; this module performs structural checks only.

use std::net::IpAddr;
use std::time::Duration;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, SubjectPublicKeyInfo,
};

use crate::errors::{Error, Result};
use crate::identity::leaf;

/// Clock-skew allowance applied to every issued certificate.
const BACKDATE: time::Duration = time::Duration::minutes(1);

/// Generate a fresh P-256 key pair for a workload identity.
pub fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate().map_err(Into::into)
}

/// The in-memory certificate authority held by the controller.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: Vec<u8>,
}

impl CertificateAuthority {
    /// Generate a new self-signed CA certificate and private key.
    ///
    /// The key pair is P-256; the certificate carries critical basic
    /// constraints with `MaxPathLen = 0` and the `CertSign` key usage.
    pub fn generate_self_signed(common_name: &str, ttl: Duration) -> Result<(String, String)> {
        if ttl.is_zero() {
            return Err(Error::validation_field("CA ttl must be positive", "ttl"));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + to_time_duration(ttl)?;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        Ok((cert.pem(), key.serialize_pem()))
    }

    /// Load a CA from its certificate and PKCS#8 private key PEM.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self> {
        if cert_pem.trim().is_empty() {
            return Err(Error::validation_field("CA certificate PEM is empty", "ca_certificate"));
        }
        if key_pem.trim().is_empty() {
            return Err(Error::validation_field("CA private key PEM is empty", "ca_key"));
        }

        let cert_der = leaf::first_der(cert_pem)?;
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::certificate_with_source("CA private key rejected", Box::new(e)))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| Error::certificate_with_source("CA certificate rejected", Box::new(e)))?;

        Ok(Self { issuer, cert_pem: cert_pem.to_string(), cert_der })
    }

    /// PEM of the CA certificate, as distributed to workloads.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER of the CA certificate, used for pinning comparisons.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issue a workload leaf bound to `spiffe_uri` for the given PKIX public
    /// key. The subject DN is left empty; identity is carried solely by the
    /// URI SAN. Extra DNS/IP SANs are appended as provided.
    pub fn issue_workload_cert(
        &self,
        spiffe_uri: &str,
        public_key_pem: &str,
        ttl: Duration,
        dns_names: &[String],
        ip_addrs: &[IpAddr],
    ) -> Result<String> {
        if !spiffe_uri.starts_with("spiffe://") {
            return Err(Error::validation_field(
                format!("'{}' is not a spiffe URI", spiffe_uri),
                "spiffe_uri",
            ));
        }
        if ttl.is_zero() {
            return Err(Error::validation_field("certificate ttl must be positive", "ttl"));
        }

        let public_key = SubjectPublicKeyInfo::from_pem(public_key_pem)
            .map_err(|e| Error::validation(format!("invalid PKIX public key: {}", e)))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ClientAuth, ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let uri = Ia5String::try_from(spiffe_uri.to_string())
            .map_err(|e| Error::validation(format!("invalid spiffe URI: {}", e)))?;
        params.subject_alt_names.push(SanType::URI(uri));
        for dns in dns_names {
            let dns = Ia5String::try_from(dns.clone())
                .map_err(|e| Error::validation(format!("invalid DNS SAN '{}': {}", dns, e)))?;
            params.subject_alt_names.push(SanType::DnsName(dns));
        }
        for addr in ip_addrs {
            params.subject_alt_names.push(SanType::IpAddress(*addr));
        }

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + to_time_duration(ttl)?;

        let cert = params.signed_by(&public_key, &self.issuer)?;
        Ok(cert.pem())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Serial numbers are drawn uniformly from a 62-bit space.
fn random_serial() -> SerialNumber {
    let serial: u64 = rand::random::<u64>() >> 2;
    SerialNumber::from_slice(&serial.to_be_bytes())
}

fn to_time_duration(ttl: Duration) -> Result<time::Duration> {
    time::Duration::try_from(ttl)
        .map_err(|_| Error::validation_field("certificate ttl out of range", "ttl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::leaf::ParsedLeaf;
    use x509_parser::prelude::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn test_ca() -> CertificateAuthority {
        let (cert_pem, key_pem) =
            CertificateAuthority::generate_self_signed("trustplane test ca", HOUR).unwrap();
        CertificateAuthority::load(&cert_pem, &key_pem).unwrap()
    }

    #[test]
    fn generated_ca_has_ca_constraints() {
        let (cert_pem, _) =
            CertificateAuthority::generate_self_signed("trustplane test ca", HOUR).unwrap();
        let der = leaf::first_der(&cert_pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let mut saw_basic_constraints = false;
        let mut saw_cert_sign = false;
        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => {
                    saw_basic_constraints = true;
                    assert!(bc.ca);
                    assert_eq!(bc.path_len_constraint, Some(0));
                }
                ParsedExtension::KeyUsage(ku) => {
                    saw_cert_sign = ku.key_cert_sign();
                }
                _ => {}
            }
        }
        assert!(saw_basic_constraints, "CA must carry basic constraints");
        assert!(saw_cert_sign, "CA must carry the CertSign key usage");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(
            CertificateAuthority::generate_self_signed("ca", Duration::from_secs(0)).is_err()
        );
        let ca = test_ca();
        let key = generate_key_pair().unwrap();
        assert!(ca
            .issue_workload_cert(
                "spiffe://mycorp.internal/connector/c1",
                &key.public_key_pem(),
                Duration::from_secs(0),
                &[],
                &[],
            )
            .is_err());
    }

    #[test]
    fn load_rejects_empty_and_malformed_input() {
        assert!(CertificateAuthority::load("", "key").is_err());
        assert!(CertificateAuthority::load("cert", "").is_err());
        assert!(CertificateAuthority::load("not pem", "not pem either").is_err());
    }

    #[test]
    fn issued_leaf_carries_single_spiffe_uri() {
        let ca = test_ca();
        let key = generate_key_pair().unwrap();
        let pem = ca
            .issue_workload_cert(
                "spiffe://mycorp.internal/connector/c1",
                &key.public_key_pem(),
                HOUR,
                &[],
                &["10.0.0.5".parse().unwrap()],
            )
            .unwrap();

        let parsed = ParsedLeaf::from_pem(&pem).unwrap();
        assert_eq!(parsed.spiffe_uri, "spiffe://mycorp.internal/connector/c1");
        assert_eq!(parsed.ip_sans, vec!["10.0.0.5".parse::<std::net::IpAddr>().unwrap()]);
        assert!(parsed.not_before < parsed.not_after);
    }

    #[test]
    fn issued_leaf_verifies_against_ca() {
        let ca = test_ca();
        let key = generate_key_pair().unwrap();
        let pem = ca
            .issue_workload_cert(
                "spiffe://mycorp.internal/tunneler/t1",
                &key.public_key_pem(),
                HOUR,
                &[],
                &[],
            )
            .unwrap();

        let leaf_der = leaf::first_der(&pem).unwrap();
        let (_, leaf_cert) = X509Certificate::from_der(&leaf_der).unwrap();
        let (_, ca_cert) = X509Certificate::from_der(ca.cert_der()).unwrap();
        leaf_cert
            .verify_signature(Some(ca_cert.public_key()))
            .expect("leaf must chain to the issuing CA");
    }

    #[test]
    fn rejects_non_spiffe_uri() {
        let ca = test_ca();
        let key = generate_key_pair().unwrap();
        assert!(ca
            .issue_workload_cert(
                "https://mycorp.internal/connector/c1",
                &key.public_key_pem(),
                HOUR,
                &[],
                &[],
            )
            .is_err());
    }

    #[test]
    fn rejects_garbage_public_key() {
        let ca = test_ca();
        assert!(ca
            .issue_workload_cert(
                "spiffe://mycorp.internal/connector/c1",
                "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n",
                HOUR,
                &[],
                &[],
            )
            .is_err());
    }
}
