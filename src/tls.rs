//! TLS server configuration from PEM material (certificate chain plus a
//! PKCS#8 or RSA private key).

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::sync::Arc;

/// Build a rustls ServerConfig from PEM certificate and key files.
pub fn server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = fs::read(cert_file).with_context(|| format!("Open cert file: {}", cert_file))?;
    let key_pem = fs::read(key_file).with_context(|| format!("Open key file: {}", key_file))?;
    server_config_from_pem(&cert_pem, &key_pem)
}

/// Build a rustls ServerConfig from in-memory PEM bytes.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = certs(&mut std::io::Cursor::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        bail!("No certificates in PEM data");
    }
    let key = private_key_from_pem(key_pem)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

fn private_key_from_pem(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut std::io::Cursor::new(key_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut std::io::Cursor::new(key_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key in PEM data"))
}

/// Check at startup that the PEM files exist and build a working config.
pub fn validate_tls_files(cert_file: &str, key_file: &str) -> Result<()> {
    server_config_from_files(cert_file, key_file)?;
    Ok(())
}
