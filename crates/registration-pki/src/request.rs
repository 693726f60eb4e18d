//! PKCS#10 subject extraction
//!
//! The hub approver never re-signs requests; it only reads the subject to
//! decide whether a CSR is a recognizable renewal.

use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use crate::{PkiError, Result};

/// Subject fields extracted from a PEM-encoded PKCS#10 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    /// Requested common name
    pub common_name: String,
    /// Requested organizations
    pub organizations: Vec<String>,
}

impl CsrSubject {
    /// Parse the subject out of a PEM-encoded certificate request
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let pem = ::pem::parse(pem_data)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse PEM: {}", e)))?;
        if pem.tag() != "CERTIFICATE REQUEST" {
            return Err(PkiError::InvalidCsr(format!(
                "PEM block type is {:?}, not CERTIFICATE REQUEST",
                pem.tag()
            )));
        }

        let (_, csr) = X509CertificationRequest::from_der(pem.contents())
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse PKCS#10: {}", e)))?;

        let subject = &csr.certification_request_info.subject;
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organizations = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            common_name,
            organizations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{generate_key_pair, serialize_csr_pem, Subject};

    #[test]
    fn extracts_cluster_subject() {
        let key = generate_key_pair().unwrap();
        let subject = Subject::for_cluster("cluster1", "agent1");
        let pem = serialize_csr_pem(&subject, &[], &key).unwrap();

        let parsed = CsrSubject::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed.common_name, subject.common_name);
        assert_eq!(parsed.organizations.len(), 2);
    }

    #[test]
    fn rejects_wrong_pem_type() {
        let key = generate_key_pair().unwrap().serialize_pem();
        let err = CsrSubject::from_pem(key.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("not CERTIFICATE REQUEST"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(CsrSubject::from_pem(b"garbage").is_err());
    }
}
