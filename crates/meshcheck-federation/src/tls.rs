use axum_server::tls_rustls::RustlsConfig;

use crate::error::PeerError;

/// Self-signed certificate covering the advertised host and loopback.
pub(crate) fn self_signed_pem(host: &str) -> Result<(Vec<u8>, Vec<u8>), PeerError> {
    let mut names = vec![host.to_string()];
    for fallback in ["localhost", "127.0.0.1"] {
        if !names.iter().any(|name| name == fallback) {
            names.push(fallback.to_string());
        }
    }
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(names).map_err(|e| PeerError::Tls(e.to_string()))?;
    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

pub(crate) async fn rustls_config(host: &str) -> Result<RustlsConfig, PeerError> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let (cert_pem, key_pem) = self_signed_pem(host)?;
    RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| PeerError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_is_pem_encoded() {
        let (cert, key) = self_signed_pem("peer.local").expect("certificate");
        assert!(String::from_utf8_lossy(&cert).starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(String::from_utf8_lossy(&key).contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn rustls_config_loads_generated_pem() {
        rustls_config("localhost").await.expect("rustls config");
    }
}
