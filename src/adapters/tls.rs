//! TLS certificate loading for the HTTPS listeners.
use std::{fs::File, io::BufReader, sync::Arc};

use eyre::{eyre, Context, Result};
use rustls_pemfile::{certs, pkcs8_private_keys};

/// Build a rustls server config from PEM cert chain and PKCS#8 key files.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<rustls::ServerConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_file = &mut BufReader::new(
        File::open(cert_path).wrap_err_with(|| format!("failed to open cert file {cert_path}"))?,
    );
    let key_file = &mut BufReader::new(
        File::open(key_path).wrap_err_with(|| format!("failed to open key file {key_path}"))?,
    );

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in {key_path}"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_error_out() {
        assert!(load_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }
}
