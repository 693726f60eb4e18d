//! PKI operations for the registration control plane
//!
//! Spoke agents generate their own key pairs and send only CSRs; the hub
//! approves renewals and the store's signer issues certificates. This crate
//! holds everything both sides need: subject derivation, key and PKCS#10
//! generation, certificate introspection, CSR subject parsing, and
//! kubeconfig rendering.
//!
//! # Certificate rotation
//!
//! Client certificates are renewed once 80% of their lifetime has passed,
//! measured against the leaf's own notBefore/notAfter so rotation does not
//! depend on wall-clock agreement with the signer.

mod cert;
mod csr;
mod kubeconfig;
mod request;
mod subject;

pub use cert::{parse_cert_chain_pem, CertificateInfo, ROTATION_THRESHOLD};
pub use csr::{generate_key_pair, serialize_csr_pem};
pub use kubeconfig::render_kubeconfig;
pub use request::CsrSubject;
pub use subject::Subject;

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid or unparseable CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}
