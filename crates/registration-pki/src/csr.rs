//! Key pair and PKCS#10 generation for spoke identities
//!
//! Private keys never leave the agent; only the serialized request is
//! submitted to the hub.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, Ia5String, KeyPair, SanType,
};

use crate::{PkiError, Result, Subject};

/// Generate a fresh key pair, returned as PKCS#8 PEM
pub fn generate_key_pair() -> Result<KeyPair> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key pair: {}", e)))
}

/// Build a PKCS#10 certificate request PEM for the given subject and SANs,
/// signed with `key_pair`.
pub fn serialize_csr_pem(subject: &Subject, dns_names: &[String], key_pair: &KeyPair) -> Result<String> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(subject.common_name.clone()),
    );
    for org in &subject.organizations {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    for unit in &subject.organization_units {
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(unit.clone()),
        );
    }
    params.distinguished_name = dn;

    params.subject_alt_names = dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| {
                    PkiError::CertificateGenerationFailed(format!(
                        "invalid DNS name '{}': {}",
                        name, e
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    let csr = params.serialize_request(key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
    })?;

    csr.pem().map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
    })
}
