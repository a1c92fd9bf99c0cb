// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the bridge.
//!
//! Errors are split by how far they reach. [`CertificateStoreError`] is fatal to the process and
//! only occurs at startup. Everything else is contained to a single session: a
//! [`HandshakeError`] or [`RelayError`] ends up wrapped in a [`SessionError`], which maps onto
//! the session's terminal [`SessionStatus`].

use std::{path::PathBuf, time::Duration};

use crate::{
    relay::Direction,
    session::{SessionStage, SessionStatus},
};

/// Errors loading the certificate store at startup.
///
/// None of these are recoverable without operator intervention.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CertificateStoreError {
    /// A credential file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// OpenSSL rejected the credentials or the TLS configuration.
    ///
    /// This is usually because a file isn't valid PEM, the private key doesn't match the
    /// certificate, or the system OpenSSL doesn't support the configured protocol versions.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// The CA certificate file contained no certificates.
    #[error("no CA certificates found in {}", path.display())]
    NoTrustAnchors { path: PathBuf },

    /// The CA private key does not belong to the CA certificate.
    #[error("the CA private key at {} does not match the CA certificate", path.display())]
    CaKeyMismatch { path: PathBuf },

    /// The bridge's own certificate can't be used as an identity.
    #[error("the bridge certificate is unusable: {0}")]
    Identity(#[from] IdentityError),
}

/// Errors extracting a peer identity from an established TLS session.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The peer completed the handshake without presenting a certificate.
    ///
    /// The acceptor is configured to fail such handshakes, so this only happens if the TLS
    /// configuration is wrong. It is still treated as fatal to the session.
    #[error("the peer did not present a certificate")]
    MissingPeerCertificate,

    /// The peer's certificate subject has no common name.
    #[error("the peer certificate does not include a common name")]
    MissingCommonName,

    /// The peer's common name could not be decoded as UTF-8.
    #[error("the peer certificate common name is not valid UTF-8: {0}")]
    InvalidCommonName(openssl::error::ErrorStack),

    /// The peer's common name contains a NUL character.
    #[error("the peer certificate common name contains a NUL character: {0:?}")]
    EmbeddedNul(String),

    /// OpenSSL recorded a verification failure for the peer certificate.
    #[error("the peer certificate is not trusted: {0}")]
    Untrusted(String),
}

/// Errors during a single leg's TLS handshake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The handshake did not complete within the configured bound.
    #[error("the TLS handshake did not complete within {0:?}")]
    Timeout(Duration),

    /// The TLS handshake failed.
    ///
    /// This covers protocol negotiation failures (no common version or cipher), a missing
    /// certificate, a certificate that doesn't chain to the trust anchors, or an expired one.
    #[error("the TLS handshake failed: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// OpenSSL could not set up the session for the handshake.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// The handshake succeeded but the peer identity is unusable.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Errors while relaying bytes between two established legs.
///
/// Partially relayed data is not recoverable; retrying is up to the protocol running over the
/// bridge.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RelayError {
    /// Reading from the source leg or writing to the destination leg failed.
    #[error("relaying {direction} failed: {source}")]
    Io {
        direction: Direction,
        source: std::io::Error,
    },
}

/// The reason a session ended without completing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("server leg handshake failed: {0}")]
    ServerHandshake(#[source] HandshakeError),

    #[error("no client connected within {0:?} of the server handshake completing")]
    ClientTimeout(Duration),

    #[error("client leg handshake failed: {0}")]
    ClientHandshake(#[source] HandshakeError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The bridge is shutting down.
    #[error("session cancelled during {0}")]
    Cancelled(SessionStage),
}

impl SessionError {
    /// The terminal status a session ending with this error reports.
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionError::ServerHandshake(_) => SessionStatus::ServerHandshakeFailed,
            SessionError::ClientTimeout(_) => SessionStatus::ClientTimeout,
            SessionError::ClientHandshake(_) => SessionStatus::ClientHandshakeFailed,
            SessionError::Relay(_) => SessionStatus::RelayError,
            SessionError::Cancelled(_) => SessionStatus::Cancelled,
        }
    }

    /// The stage of the session that failed.
    pub fn stage(&self) -> SessionStage {
        match self {
            SessionError::ServerHandshake(_) => SessionStage::ServerHandshake,
            SessionError::ClientTimeout(_) => SessionStage::AwaitingClient,
            SessionError::ClientHandshake(_) => SessionStage::ClientHandshake,
            SessionError::Relay(_) => SessionStage::Relay,
            SessionError::Cancelled(stage) => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_status_and_stage() {
        let cases = [
            (
                SessionError::ServerHandshake(HandshakeError::Timeout(Duration::from_secs(1))),
                SessionStatus::ServerHandshakeFailed,
                SessionStage::ServerHandshake,
            ),
            (
                SessionError::ClientTimeout(Duration::from_secs(30)),
                SessionStatus::ClientTimeout,
                SessionStage::AwaitingClient,
            ),
            (
                SessionError::ClientHandshake(IdentityError::MissingCommonName.into()),
                SessionStatus::ClientHandshakeFailed,
                SessionStage::ClientHandshake,
            ),
            (
                RelayError::Io {
                    direction: Direction::ClientToServer,
                    source: std::io::ErrorKind::BrokenPipe.into(),
                }
                .into(),
                SessionStatus::RelayError,
                SessionStage::Relay,
            ),
            (
                SessionError::Cancelled(SessionStage::AwaitingClient),
                SessionStatus::Cancelled,
                SessionStage::AwaitingClient,
            ),
        ];

        for (error, status, stage) in cases {
            assert_eq!(status, error.status(), "{error}");
            assert_eq!(stage, error.stage(), "{error}");
        }
    }
}
