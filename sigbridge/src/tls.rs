// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The bridge's certificate store and the TLS configuration derived from it.
//!
//! The store is loaded once at startup and is immutable afterwards. Sessions receive it through
//! an [`std::sync::Arc`] and only ever create new [`Ssl`] objects from it.

use std::path::Path;

use openssl::{
    error::ErrorStack,
    pkey::{PKey, Private},
    ssl::{Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode},
    x509::X509,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::{Credentials, TlsVersion},
    error::CertificateStoreError,
    identity::{Identity, Role},
};

/// Which side of the TLS handshake the bridge plays on a leg.
///
/// Regardless of the role, the bridge always presents its own certificate and requires one
/// from the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsRole {
    /// The bridge acts as the TLS server.
    #[default]
    Accept,
    /// The bridge acts as the TLS client on a connection the peer opened.
    Connect,
}

/// The bridge's identity, its trust anchors, and the TLS contexts built from them.
pub struct CertificateStore {
    acceptor: SslAcceptor,
    connector: SslConnector,
    identity: Identity,
    // Only the bridge holds the CA key. It is checked at load time and never leaves the store.
    ca_private_key: Option<PKey<Private>>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("identity", &self.identity)
            .field("holds_ca_private_key", &self.holds_ca_private_key())
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    /// Load the certificate store described by `credentials`.
    ///
    /// Only protocol versions between `min_version` and `max_version` (inclusive) are offered
    /// or accepted.
    ///
    /// # Errors
    ///
    /// Any unreadable or invalid file is an error, as is a bridge key that doesn't match the
    /// bridge certificate, or a CA key that doesn't match the CA certificate.
    pub fn load(
        credentials: &Credentials,
        min_version: TlsVersion,
        max_version: TlsVersion,
    ) -> Result<Self, CertificateStoreError> {
        let private_key = PKey::private_key_from_pem(&read(&credentials.private_key)?)?;
        let certificate = X509::from_pem(&read(&credentials.certificate)?)?;
        let trust_anchors = X509::stack_from_pem(&read(&credentials.ca_certificate)?)?;
        if trust_anchors.is_empty() {
            return Err(CertificateStoreError::NoTrustAnchors {
                path: credentials.ca_certificate.clone(),
            });
        }

        let ca_private_key = match &credentials.ca_private_key {
            Some(path) => {
                let key = PKey::private_key_from_pem(&read(path)?)?;
                let matches = trust_anchors
                    .iter()
                    .map(|ca| ca.public_key())
                    .collect::<Result<Vec<_>, _>>()?
                    .iter()
                    .any(|public| public.public_eq(&key));
                if !matches {
                    return Err(CertificateStoreError::CaKeyMismatch { path: path.clone() });
                }
                Some(key)
            }
            None => None,
        };

        let identity = Identity::from_certificate(&certificate, Role::Bridge)?;

        // TODO bump to mozilla_modern_v5 if RHEL10 supports that
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(min_version.into()))?;
        acceptor.set_max_proto_version(Some(max_version.into()))?;
        for ca in &trust_anchors {
            acceptor.add_client_ca(ca)?;
            acceptor.cert_store_mut().add_cert(ca.to_owned())?;
        }
        acceptor.set_private_key(&private_key)?;
        acceptor.set_certificate(&certificate)?;
        acceptor.check_private_key()?;

        let mut connector = SslConnector::builder(SslMethod::tls())?;
        connector.set_verify(SslVerifyMode::PEER);
        connector.set_min_proto_version(Some(min_version.into()))?;
        connector.set_max_proto_version(Some(max_version.into()))?;
        for ca in &trust_anchors {
            connector.cert_store_mut().add_cert(ca.to_owned())?;
        }
        connector.set_private_key(&private_key)?;
        connector.set_certificate(&certificate)?;
        connector.check_private_key()?;

        Ok(Self {
            acceptor: acceptor.build(),
            connector: connector.build(),
            identity,
            ca_private_key,
        })
    }

    /// The bridge's own identity, as presented to peers.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the CA signing key was loaded into this store.
    pub fn holds_ca_private_key(&self) -> bool {
        self.ca_private_key.is_some()
    }

    /// Create the TLS state for a new leg.
    pub(crate) fn ssl(&self, role: TlsRole) -> Result<Ssl, ErrorStack> {
        match role {
            TlsRole::Accept => Ssl::new(self.acceptor.context()),
            // Peers are identified by common name, not by hostname, so there's nothing to
            // check the hostname against.
            TlsRole::Connect => self
                .connector
                .configure()?
                .verify_hostname(false)
                .use_server_name_indication(false)
                .into_ssl("sigbridge-peer"),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CertificateStoreError> {
    std::fs::read(path).map_err(|source| CertificateStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
