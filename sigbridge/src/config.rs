// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Credential and configuration file handling shared by the bridge and its CLI.

use std::path::{Path, PathBuf};

use openssl::ssl::SslVersion;
use serde::{Deserialize, Serialize};

/// The certificate store the bridge authenticates with.
///
/// It is highly recommended that you use systemd credentials to ensure the private keys are
/// only accessible to the bridge. If the paths provided are relative, they are resolved against
/// the `$CREDENTIALS_DIRECTORY` environment variable (see [`Credentials::with_credentials_dir`]).
///
/// The store is populated by the PKI bootstrap ahead of time; the bridge only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The PEM-encoded private key matching `certificate`.
    ///
    /// To prepare an encrypted systemd credential:
    ///
    /// ```bash
    /// systemd-creds encrypt /secure/ramfs/private-key.pem /etc/credstore.encrypted/sigbridge.private_key
    /// ```
    pub private_key: PathBuf,
    /// The bridge's PEM-encoded identity certificate.
    pub certificate: PathBuf,
    /// The PEM-encoded certificate authority (one or more certificates) used as trust anchors
    /// when verifying server and client certificates.
    pub ca_certificate: PathBuf,
    /// The PEM-encoded private key of the certificate authority.
    ///
    /// The bridge is the only host holding this key. When provided, it is loaded at startup and
    /// checked against `ca_certificate` so a mismatched store is caught before any connection
    /// is accepted. The bridge never writes or exports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_private_key: Option<PathBuf>,
}

impl Credentials {
    /// Fix up any relative paths in the configuration file to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If the referenced files don't exist, an error is returned.
    pub fn with_credentials_dir(&mut self, credentials_dir: &Path) -> anyhow::Result<()> {
        if self.private_key.is_absolute() {
            tracing::warn!(
                private_key = self.private_key.display().to_string(),
                "Path to private key file is absolute; consider using systemd credentials"
            );
        }
        if let Some(ca_private_key) = &self.ca_private_key {
            if ca_private_key.is_absolute() {
                tracing::warn!(
                    ca_private_key = ca_private_key.display().to_string(),
                    "Path to CA private key file is absolute; consider using systemd credentials"
                );
            }
        }

        resolve(&mut self.private_key, credentials_dir, "private key")?;
        resolve(&mut self.certificate, credentials_dir, "certificate")?;
        resolve(&mut self.ca_certificate, credentials_dir, "CA certificate")?;
        if let Some(ca_private_key) = self.ca_private_key.as_mut() {
            resolve(ca_private_key, credentials_dir, "CA private key")?;
        }

        Ok(())
    }
}

fn resolve(path: &mut PathBuf, credentials_dir: &Path, what: &str) -> anyhow::Result<()> {
    if path.is_absolute() {
        return Ok(());
    }
    *path = credentials_dir.join(&*path);
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "No {what} file named '{}' found in credentials directory",
            path.display()
        ));
    }
    Ok(())
}

/// A TLS protocol version the bridge is willing to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl From<TlsVersion> for SslVersion {
    fn from(version: TlsVersion) -> Self {
        match version {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    use anyhow::Context;

    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked. If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let path = path.or_else(|| {
        std::env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .ok()
            .map(|base_path| PathBuf::from(base_path).join(default))
            .filter(|path| path.is_file())
    });

    match path {
        Some(path) => {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        }
        None => {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        }
    }
}
