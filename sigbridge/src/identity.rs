// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Peer identities extracted from TLS certificates.
//!
//! The role of a peer is decided by which listener accepted its connection, not by anything in
//! its certificate. The certificate only provides the common name, which is logged and
//! reported for correlation. Chain validation is OpenSSL's job during the handshake; this
//! module only checks that it happened and succeeded.

use std::fmt::Display;

use openssl::{
    nid::Nid,
    ssl::SslRef,
    x509::{X509Ref, X509VerifyResult},
};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// The part a certificate holder plays in a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
    Bridge,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
            Role::Bridge => write!(f, "bridge"),
        }
    }
}

/// A verified certificate holder.
///
/// An identity is produced once per leg after its handshake and is never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    common_name: String,
    role: Role,
}

impl Identity {
    /// Build the identity of the given certificate's holder.
    pub fn from_certificate(certificate: &X509Ref, role: Role) -> Result<Self, IdentityError> {
        Ok(Self {
            common_name: common_name(certificate)?,
            role,
        })
    }

    /// The subject common name of the certificate.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.common_name, self.role)
    }
}

/// Extract the identity of the peer of an established TLS session.
///
/// # Errors
///
/// Mutual authentication is mandatory, so a session without a peer certificate, or one where
/// OpenSSL recorded a verification failure, is an error.
pub fn peer_identity(ssl: &SslRef, role: Role) -> Result<Identity, IdentityError> {
    let certificate = ssl
        .peer_certificate()
        .ok_or(IdentityError::MissingPeerCertificate)?;
    let verify_result = ssl.verify_result();
    if verify_result != X509VerifyResult::OK {
        return Err(IdentityError::Untrusted(
            verify_result.error_string().to_string(),
        ));
    }

    Identity::from_certificate(&certificate, role)
}

/// Get the first common name in the certificate's subject.
pub fn common_name(certificate: &X509Ref) -> Result<String, IdentityError> {
    let entry = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or(IdentityError::MissingCommonName)?;
    let name = entry
        .data()
        .to_string()
        .map_err(IdentityError::InvalidCommonName)?;
    if name.is_empty() {
        return Err(IdentityError::MissingCommonName);
    }
    if name.contains('\0') {
        return Err(IdentityError::EmbeddedNul(name));
    }

    Ok(name)
}
