// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Driving each leg's TLS handshake to completion.
//!
//! A leg starts out as a [`PendingLeg`], a raw TCP connection fresh from a listener. Calling
//! [`PendingLeg::handshake`] explicitly runs the whole TLS handshake, including peer certificate
//! verification and identity extraction, and yields an established [`Leg`]. The handshake is
//! never left for the first read or write to complete implicitly: a leg that is accepted but
//! not handshaked leaves its peer waiting, and peers give up.

use std::{fmt::Display, net::SocketAddr, pin::Pin, time::Duration};

use tokio::{io::AsyncWriteExt, net::TcpStream, time::Instant};
use tokio_openssl::SslStream;
use tracing::instrument;

use crate::{
    error::HandshakeError,
    identity::{peer_identity, Identity, Role},
    tls::{CertificateStore, TlsRole},
};

/// Which listener a leg arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    ServerLeg,
    ClientLeg,
}

impl LegRole {
    /// The role of the peer at the other end of a leg.
    pub fn peer_role(self) -> Role {
        match self {
            LegRole::ServerLeg => Role::Server,
            LegRole::ClientLeg => Role::Client,
        }
    }
}

impl Display for LegRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegRole::ServerLeg => write!(f, "server-leg"),
            LegRole::ClientLeg => write!(f, "client-leg"),
        }
    }
}

/// The lifecycle of a leg.
///
/// `Pending -> Handshaking -> Established -> Closed`, or `Failed` from any point before
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Pending,
    Handshaking,
    Established,
    Closed,
    Failed,
}

impl Display for LegState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegState::Pending => write!(f, "pending"),
            LegState::Handshaking => write!(f, "handshaking"),
            LegState::Established => write!(f, "established"),
            LegState::Closed => write!(f, "closed"),
            LegState::Failed => write!(f, "failed"),
        }
    }
}

/// A TCP connection accepted by one of the listeners that has not started TLS yet.
#[derive(Debug)]
pub struct PendingLeg {
    role: LegRole,
    stream: TcpStream,
    peer_addr: SocketAddr,
    accepted_at: Instant,
}

impl PendingLeg {
    pub fn new(role: LegRole, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            role,
            stream,
            peer_addr,
            accepted_at: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the listener accepted the TCP connection.
    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// Run the TLS handshake now and extract the peer's identity.
    ///
    /// The bridge plays `tls_role` in the handshake. Only certificates chaining to the store's
    /// trust anchors are accepted, and the whole handshake must finish within `timeout`.
    ///
    /// # Errors
    ///
    /// Any handshake failure is returned and the connection is closed.
    #[instrument(
        level = "debug",
        skip_all,
        err(level = "debug"),
        fields(leg = %self.role, peer_addr = %self.peer_addr, tls_role = ?tls_role)
    )]
    pub async fn handshake(
        self,
        store: &CertificateStore,
        tls_role: TlsRole,
        timeout: Duration,
    ) -> Result<Leg, HandshakeError> {
        let role = self.role;
        tracing::trace!(from = %LegState::Pending, to = %LegState::Handshaking, "Leg state changed");

        let result = async {
            let ssl = store.ssl(tls_role)?;
            let mut stream = SslStream::new(ssl, self.stream)?;
            let handshake = async {
                match tls_role {
                    TlsRole::Accept => Pin::new(&mut stream).accept().await,
                    TlsRole::Connect => Pin::new(&mut stream).connect().await,
                }
            };
            tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| HandshakeError::Timeout(timeout))??;

            let identity = peer_identity(stream.ssl(), role.peer_role())?;
            Ok::<_, HandshakeError>((stream, identity))
        }
        .await;

        match result {
            Ok((stream, identity)) => {
                tracing::debug!(
                    from = %LegState::Handshaking,
                    to = %LegState::Established,
                    peer = identity.common_name(),
                    version = stream.ssl().version_str(),
                    "Leg state changed"
                );
                Ok(Leg {
                    role,
                    identity,
                    stream,
                    established_at: Instant::now(),
                })
            }
            Err(error) => {
                tracing::debug!(from = %LegState::Handshaking, to = %LegState::Failed, "Leg state changed");
                Err(error)
            }
        }
    }
}

/// A leg whose handshake completed and whose peer identity has been extracted.
///
/// The leg owns its socket. Dropping it closes the connection; [`Leg::close`] additionally
/// tells the peer the session is over with a TLS `close_notify`.
#[derive(Debug)]
pub struct Leg {
    role: LegRole,
    identity: Identity,
    stream: SslStream<TcpStream>,
    established_at: Instant,
}

impl Leg {
    /// The identity the peer authenticated with.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// When the handshake finished.
    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub(crate) fn into_stream(self) -> SslStream<TcpStream> {
        self.stream
    }

    /// Send the peer a `close_notify` and close the connection.
    ///
    /// The peer has `timeout` to take the alert before the connection is dropped regardless.
    pub async fn close(mut self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(leg = %self.role, ?error, "Failed to shut down leg cleanly");
            }
            Err(_) => {
                tracing::debug!(leg = %self.role, ?timeout, "Timed out shutting down leg");
            }
        }
        tracing::trace!(leg = %self.role, from = %LegState::Established, to = %LegState::Closed, "Leg state changed");
    }
}
