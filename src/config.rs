//! YAML-loadable server settings for embedders that configure the server
//! from a file instead of code.

use crate::server::Server;
use crate::tls;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub listen: ListenSettings,
    /// Per-read deadline in seconds; absent means no deadline.
    pub read_timeout_secs: Option<u64>,
    /// Per-write deadline in seconds; absent means no deadline.
    pub write_timeout_secs: Option<u64>,
    /// Required for ldaps:// listeners; enables StartTLS otherwise.
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    /// ldap://host:port or ldaps://host:port
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Read config file {:?}", path))?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("Parse YAML config")
    }
}

impl Server {
    /// Apply file-based settings: timeouts and TLS. The listen URL is left
    /// to the caller, which passes it to `listen_and_serve`.
    pub fn configure(&self, settings: &Settings) -> Result<()> {
        self.set_read_timeout(settings.read_timeout_secs.map(Duration::from_secs));
        self.set_write_timeout(settings.write_timeout_secs.map(Duration::from_secs));
        if let Some(ref tls_settings) = settings.tls {
            let config =
                tls::server_config_from_files(&tls_settings.cert_file, &tls_settings.key_file)?;
            self.set_tls_config(config);
        } else if settings.listen.url.starts_with("ldaps://") {
            anyhow::bail!("ldaps:// listen URL requires a tls section");
        }
        Ok(())
    }
}
