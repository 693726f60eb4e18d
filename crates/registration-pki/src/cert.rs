//! Certificate introspection and rotation decisions

use chrono::{DateTime, TimeZone, Utc};
use x509_parser::prelude::*;

use crate::{PkiError, Result, Subject};

/// Rotation threshold as a fraction of the leaf's lifetime (80%).
/// A certificate past this point should be renewed.
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Validity and identity attributes of a parsed client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid
    pub not_before: DateTime<Utc>,
    /// When the certificate expires
    pub not_after: DateTime<Utc>,
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from the first certificate in a PEM bundle
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let ders = parse_cert_chain_pem(pem_data)?;
        let leaf = ders
            .first()
            .ok_or_else(|| PkiError::ParseError("no certificate in PEM data".to_string()))?;
        Self::from_der(leaf)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let not_before = Utc
            .timestamp_opt(cert.validity().not_before.timestamp(), 0)
            .single()
            .ok_or_else(|| PkiError::ParseError("notBefore out of range".to_string()))?;
        let not_after = Utc
            .timestamp_opt(cert.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| PkiError::ParseError("notAfter out of range".to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            not_before,
            not_after,
            common_name,
            organizations,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        (self.not_after - self.not_before).num_seconds()
    }

    /// Whether the certificate has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Whether the certificate should be renewed at `now`.
    ///
    /// Measured against the leaf's own validity window so the decision is
    /// independent of the signer's wall clock.
    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return true;
        }
        let age = (now - self.not_before).num_seconds();
        age as f64 / lifetime as f64 >= ROTATION_THRESHOLD
    }

    /// Verify the leaf identity matches the subject submitted in the CSR.
    ///
    /// Signers may reorder or extend organizations, so the check requires the
    /// requested CN and that every requested organization is present.
    pub fn matches_subject(&self, subject: &Subject) -> bool {
        self.common_name == subject.common_name
            && subject
                .organizations
                .iter()
                .all(|org| self.organizations.contains(org))
    }
}

/// Parse every certificate in a PEM bundle into DER, leaf first.
pub fn parse_cert_chain_pem(pem_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut ders = vec![];
    for entry in Pem::iter_from_buffer(pem_data) {
        let pem =
            entry.map_err(|e| PkiError::ParseError(format!("failed to parse PEM block: {}", e)))?;
        if pem.label != "CERTIFICATE" {
            return Err(PkiError::ParseError(format!(
                "unexpected PEM block {:?} in certificate chain",
                pem.label
            )));
        }
        // every block must at least parse as a certificate
        X509Certificate::from_der(&pem.contents)
            .map_err(|e| PkiError::ParseError(format!("invalid certificate in chain: {}", e)))?;
        ders.push(pem.contents);
    }
    if ders.is_empty() {
        return Err(PkiError::ParseError(
            "no certificate in PEM data".to_string(),
        ));
    }
    Ok(ders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

    /// Self-sign a certificate with the given subject and validity window
    fn issue_cert(subject: &Subject, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> String {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(subject.common_name.clone()),
        );
        for org in &subject.organizations {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        params.distinguished_name = dn;
        params.not_before =
            ::time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).unwrap();
        params.not_after =
            ::time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn cluster_subject() -> Subject {
        Subject::for_cluster("cluster1", "agent1")
    }

    #[test]
    fn parses_identity_from_pem() {
        let now = Utc::now();
        let pem = issue_cert(&cluster_subject(), now, now + Duration::days(365));
        let info = CertificateInfo::from_pem(pem.as_bytes()).unwrap();

        assert_eq!(info.common_name, "open-cluster-management:cluster1:agent1");
        assert!(info
            .organizations
            .contains(&"open-cluster-management:cluster1".to_string()));
        assert!(info.matches_subject(&cluster_subject()));
    }

    #[test]
    fn subject_mismatch_is_detected() {
        let now = Utc::now();
        let pem = issue_cert(&cluster_subject(), now, now + Duration::days(365));
        let info = CertificateInfo::from_pem(pem.as_bytes()).unwrap();

        let other = Subject::for_cluster("cluster2", "agent1");
        assert!(!info.matches_subject(&other));
    }

    #[test]
    fn fresh_cert_does_not_need_rotation() {
        let now = Utc::now();
        let pem = issue_cert(&cluster_subject(), now, now + Duration::days(100));
        let info = CertificateInfo::from_pem(pem.as_bytes()).unwrap();

        assert!(!info.needs_rotation(now + Duration::days(10)));
        assert!(!info.is_expired(now + Duration::days(10)));
    }

    #[test]
    fn rotation_triggers_at_80_percent() {
        let now = Utc::now();
        let pem = issue_cert(&cluster_subject(), now, now + Duration::seconds(100));
        let info = CertificateInfo::from_pem(pem.as_bytes()).unwrap();

        assert!(!info.needs_rotation(now + Duration::seconds(79)));
        assert!(info.needs_rotation(now + Duration::seconds(80)));
        assert!(info.needs_rotation(now + Duration::seconds(101)));
    }

    #[test]
    fn expired_cert_reports_expired() {
        let start = Utc::now() - Duration::days(2);
        let pem = issue_cert(&cluster_subject(), start, start + Duration::days(1));
        let info = CertificateInfo::from_pem(pem.as_bytes()).unwrap();
        assert!(info.is_expired(Utc::now()));
        assert!(info.needs_rotation(Utc::now()));
    }

    #[test]
    fn chain_parse_returns_all_blocks() {
        let now = Utc::now();
        let leaf = issue_cert(&cluster_subject(), now, now + Duration::days(1));
        let issuer = issue_cert(&cluster_subject(), now, now + Duration::days(3650));
        let bundle = format!("{leaf}{issuer}");

        let ders = parse_cert_chain_pem(bundle.as_bytes()).unwrap();
        assert_eq!(ders.len(), 2);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_cert_chain_pem(b"not a pem").is_err());
        assert!(CertificateInfo::from_pem(b"").is_err());
    }

    #[test]
    fn non_certificate_block_is_rejected() {
        let key = KeyPair::generate().unwrap().serialize_pem();
        assert!(parse_cert_chain_pem(key.as_bytes()).is_err());
    }
}
