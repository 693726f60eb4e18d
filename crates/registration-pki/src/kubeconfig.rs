//! Kubeconfig rendering for the rotated hub credential
//!
//! The rendered config references the certificate and key by file path inside
//! the mounted secret, so a rotation that rewrites tls.crt/tls.key is picked
//! up without regenerating the kubeconfig itself.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;

use crate::{PkiError, Result};

/// Render a kubeconfig pointing at `server`, trusting `ca_data`, and
/// authenticating with the client certificate files next to it.
pub fn render_kubeconfig(server: &str, ca_data: Option<&[u8]>, cert_file: &str, key_file: &str) -> Result<String> {
    let mut cluster = json!({ "server": server });
    match ca_data {
        Some(ca) => {
            cluster["certificate-authority-data"] = json!(STANDARD.encode(ca));
        }
        None => {
            cluster["insecure-skip-tls-verify"] = json!(true);
        }
    }

    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "default-cluster", "cluster": cluster }],
        "users": [{
            "name": "default-auth",
            "user": {
                "client-certificate": cert_file,
                "client-key": key_file,
            }
        }],
        "contexts": [{
            "name": "default-context",
            "context": {
                "cluster": "default-cluster",
                "user": "default-auth",
                "namespace": "default",
            }
        }],
        "current-context": "default-context",
    });

    // serialized as JSON; every kubeconfig loader accepts it
    serde_json::to_string_pretty(&config)
        .map_err(|e| PkiError::ParseError(format!("failed to serialize kubeconfig: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_server_and_ca() {
        let config = render_kubeconfig(
            "https://hub.example.com:6443",
            Some(b"ca-bytes"),
            "tls.crt",
            "tls.key",
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(
            value["clusters"][0]["cluster"]["server"],
            "https://hub.example.com:6443"
        );
        assert_eq!(
            value["clusters"][0]["cluster"]["certificate-authority-data"],
            STANDARD.encode(b"ca-bytes")
        );
        assert_eq!(value["users"][0]["user"]["client-certificate"], "tls.crt");
        assert_eq!(value["current-context"], "default-context");
    }

    #[test]
    fn missing_ca_falls_back_to_insecure() {
        let config =
            render_kubeconfig("https://hub.example.com:6443", None, "tls.crt", "tls.key").unwrap();
        let value: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(
            value["clusters"][0]["cluster"]["insecure-skip-tls-verify"],
            true
        );
    }
}
