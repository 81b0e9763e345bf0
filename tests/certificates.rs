//! Certificate-shape invariants for the internal CA and its issued leaves,
//! checked against an independent X.509 parser.

use std::time::Duration;

use trustplane::identity::ca::{generate_key_pair, CertificateAuthority};
use trustplane::identity::leaf::{self, ParsedLeaf};
use x509_parser::prelude::*;

const HOUR: Duration = Duration::from_secs(3600);

fn load_test_ca() -> (CertificateAuthority, String) {
    let (cert_pem, key_pem) =
        CertificateAuthority::generate_self_signed("trustplane test ca", HOUR).unwrap();
    (CertificateAuthority::load(&cert_pem, &key_pem).unwrap(), cert_pem)
}

fn issue(ca: &CertificateAuthority, uri: &str) -> String {
    let key = generate_key_pair().unwrap();
    ca.issue_workload_cert(uri, &key.public_key_pem(), Duration::from_secs(1800), &[], &[])
        .unwrap()
}

#[test]
fn ca_certificate_invariants() {
    let (_, ca_pem) = load_test_ca();
    let der = leaf::first_der(&ca_pem).unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();

    let mut ca_flag = false;
    let mut cert_sign = false;
    let mut path_len = None;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => {
                ca_flag = bc.ca;
                path_len = bc.path_len_constraint;
                assert!(ext.critical, "basic constraints must be critical");
            }
            ParsedExtension::KeyUsage(ku) => cert_sign = ku.key_cert_sign(),
            _ => {}
        }
    }
    assert!(ca_flag);
    assert!(cert_sign);
    assert_eq!(path_len, Some(0));
}

#[test]
fn workload_leaf_invariants() {
    let (ca, _) = load_test_ca();
    let pem = issue(&ca, "spiffe://mycorp.internal/connector/c1");

    let der = leaf::first_der(&pem).unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();

    // Exactly one URI SAN, spiffe scheme, two path segments.
    let uris = leaf::uri_sans(&cert);
    assert_eq!(uris.len(), 1);
    let uri = &uris[0];
    assert!(uri.starts_with("spiffe://"));
    let path: Vec<&str> =
        uri.strip_prefix("spiffe://mycorp.internal/").unwrap().split('/').collect();
    assert_eq!(path, vec!["connector", "c1"]);

    // Not a CA; no CN-based identity.
    let mut is_ca = false;
    let mut digital_signature = false;
    let mut client_auth = false;
    let mut server_auth = false;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => is_ca = bc.ca,
            ParsedExtension::KeyUsage(ku) => digital_signature = ku.digital_signature(),
            ParsedExtension::ExtendedKeyUsage(eku) => {
                client_auth = eku.client_auth;
                server_auth = eku.server_auth;
            }
            _ => {}
        }
    }
    assert!(!is_ca);
    assert!(digital_signature);
    assert!(client_auth && server_auth);
    assert!(cert.subject().iter_common_name().next().is_none(), "subject DN must be empty");

    // Serial is drawn from a 62-bit space.
    assert!(cert.serial.bits() <= 62);
}

#[test]
fn leaf_validity_window_is_backdated() {
    let (ca, _) = load_test_ca();
    let pem = issue(&ca, "spiffe://mycorp.internal/tunneler/t1");
    let parsed = ParsedLeaf::from_pem(&pem).unwrap();

    let now = chrono::Utc::now();
    assert!(parsed.not_before < now, "not_before must be backdated for clock skew");
    assert!(now.signed_duration_since(parsed.not_before) <= chrono::Duration::minutes(2));
    let lifetime = parsed.not_after.signed_duration_since(parsed.not_before);
    assert!(lifetime >= chrono::Duration::seconds(1800));
}

#[test]
fn controller_leaf_carries_local_sans() {
    let (ca, _) = load_test_ca();
    let key = generate_key_pair().unwrap();
    let pem = ca
        .issue_workload_cert(
            "spiffe://mycorp.internal/controller/controller",
            &key.public_key_pem(),
            HOUR,
            &["localhost".to_string()],
            &["127.0.0.1".parse().unwrap()],
        )
        .unwrap();

    let parsed = ParsedLeaf::from_pem(&pem).unwrap();
    assert_eq!(parsed.dns_sans, vec!["localhost".to_string()]);
    assert_eq!(parsed.ip_sans, vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
}

#[test]
fn ca_pinning_compares_der() {
    let (_, ca_pem_a) = load_test_ca();
    let (_, ca_pem_b) = load_test_ca();

    assert!(leaf::same_certificate(&ca_pem_a, &ca_pem_a).unwrap());
    assert!(!leaf::same_certificate(&ca_pem_a, &ca_pem_b).unwrap());

    // Whitespace-only differences do not defeat the pin.
    let reflowed = ca_pem_a.replace("\r\n", "\n");
    assert!(leaf::same_certificate(&ca_pem_a, &reflowed).unwrap());
}

#[test]
fn distinct_leaves_get_distinct_serials() {
    let (ca, _) = load_test_ca();
    let a = ParsedLeaf::from_pem(&issue(&ca, "spiffe://mycorp.internal/connector/c1")).unwrap();
    let b = ParsedLeaf::from_pem(&issue(&ca, "spiffe://mycorp.internal/connector/c1")).unwrap();
    assert_ne!(a.serial, b.serial);
}
