// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A single relay session: one server leg, at most one client leg, and the bytes between them.
//!
//! The order of operations is fixed:
//!
//! 1. The server leg handshakes as soon as it is accepted.
//! 2. Only then does the session queue up for a client leg, waiting a bounded amount of time.
//! 3. The client leg handshakes.
//! 4. Bytes are relayed until both directions end or one fails.
//!
//! Every exit path closes both legs; they are owned by the session task and dropped with it.
//! Sessions share nothing but the read-only [`CertificateStore`] and the queue used to hand
//! client connections to them.

use std::{fmt::Display, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{field, Instrument};
use uuid::Uuid;

use crate::{
    error::SessionError,
    handshake::{Leg, PendingLeg},
    identity::Identity,
    relay::{Forwarder, Transferred},
    tls::{CertificateStore, TlsRole},
};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Both relay directions ended cleanly.
    Completed,
    ServerHandshakeFailed,
    /// The server leg was established but no client arrived in time.
    ClientTimeout,
    ClientHandshakeFailed,
    RelayError,
    /// The bridge shut down before the session finished.
    Cancelled,
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::ServerHandshakeFailed => write!(f, "server-handshake-failed"),
            SessionStatus::ClientTimeout => write!(f, "client-timeout"),
            SessionStatus::ClientHandshakeFailed => write!(f, "client-handshake-failed"),
            SessionStatus::RelayError => write!(f, "relay-error"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The steps a session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    ServerHandshake,
    AwaitingClient,
    ClientHandshake,
    Relay,
}

impl Display for SessionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStage::ServerHandshake => write!(f, "server handshake"),
            SessionStage::AwaitingClient => write!(f, "awaiting client"),
            SessionStage::ClientHandshake => write!(f, "client handshake"),
            SessionStage::Relay => write!(f, "relay"),
        }
    }
}

/// When each step of a session happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeline {
    /// The server leg's TCP connection was accepted and the session created.
    pub accepted: Instant,
    /// The server leg's handshake completed.
    pub server_established: Option<Instant>,
    /// The session received a client leg from the client listener.
    pub client_accepted: Option<Instant>,
    /// The client leg's handshake completed.
    pub client_established: Option<Instant>,
    /// The session ended and both legs were released.
    pub finished: Option<Instant>,
}

/// The outcome of a session, published once it ends.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub status: SessionStatus,
    /// The stage that failed, if the session didn't complete.
    pub failed_stage: Option<SessionStage>,
    /// A description of the failure, if the session didn't complete.
    pub error: Option<String>,
    pub server_addr: SocketAddr,
    pub client_addr: Option<SocketAddr>,
    pub server: Option<Identity>,
    pub client: Option<Identity>,
    pub transferred: Transferred,
    pub timeline: SessionTimeline,
}

/// Per-session settings, derived from the bridge configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// The TLS role the bridge plays on the server leg.
    pub server_leg_tls_role: TlsRole,
    /// How long each leg's TLS handshake may take.
    pub handshake_timeout: Duration,
    /// How long to wait for a client once the server leg is established.
    pub client_timeout: Duration,
    /// How long a peer has to take the `close_notify` when a leg is closed deliberately.
    pub close_timeout: Duration,
    pub forwarder: Forwarder,
}

/// Hands a client connection to a session waiting for one.
pub(crate) type ClientWaiter = oneshot::Sender<PendingLeg>;

/// A session, from the moment its server leg is accepted until both legs are closed.
pub struct Session {
    id: Uuid,
    store: Arc<CertificateStore>,
    settings: Arc<SessionSettings>,
    server_addr: SocketAddr,
    client_addr: Option<SocketAddr>,
    server: Option<Identity>,
    client: Option<Identity>,
    timeline: SessionTimeline,
}

impl Session {
    /// Create a session for a freshly accepted server leg.
    pub fn new(
        store: Arc<CertificateStore>,
        settings: Arc<SessionSettings>,
        server_leg: &PendingLeg,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            store,
            settings,
            server_addr: server_leg.peer_addr(),
            client_addr: None,
            server: None,
            client: None,
            timeline: SessionTimeline {
                accepted: server_leg.accepted_at(),
                server_established: None,
                client_accepted: None,
                client_established: None,
                finished: None,
            },
        }
    }

    /// Run the session to completion.
    ///
    /// Client legs are requested through `clients`. If `cancel` fires, the session stops at
    /// whatever stage it's in and both legs are dropped.
    pub async fn run(
        mut self,
        server_leg: PendingLeg,
        clients: mpsc::Sender<ClientWaiter>,
        cancel: CancellationToken,
    ) -> SessionReport {
        let span = tracing::info_span!(
            "session",
            session_id = %self.id,
            server_addr = %self.server_addr,
            client_addr = field::Empty,
            server = field::Empty,
            client = field::Empty,
        );
        async move {
            let result = self.sequence(server_leg, &clients, &cancel).await;
            self.timeline.finished = Some(Instant::now());
            self.report(result)
        }
        .instrument(span)
        .await
    }

    async fn sequence(
        &mut self,
        server_leg: PendingLeg,
        clients: &mpsc::Sender<ClientWaiter>,
        cancel: &CancellationToken,
    ) -> Result<Transferred, SessionError> {
        let settings = self.settings.clone();

        let server = cancellable(
            cancel,
            SessionStage::ServerHandshake,
            server_leg.handshake(
                &self.store,
                settings.server_leg_tls_role,
                settings.handshake_timeout,
            ),
        )
        .await?
        .map_err(SessionError::ServerHandshake)?;
        self.timeline.server_established = Some(server.established_at());
        self.server = Some(server.identity().clone());
        tracing::Span::current().record("server", server.identity().common_name());
        tracing::info!("Server leg established; waiting for a client");

        let client_leg = match self.await_client(clients, cancel).await {
            Ok(client_leg) => client_leg,
            Err(error) => {
                if let SessionError::ClientTimeout(_) = error {
                    server.close(settings.close_timeout).await;
                }
                return Err(error);
            }
        };
        self.timeline.client_accepted = Some(Instant::now());
        self.client_addr = Some(client_leg.peer_addr());
        tracing::Span::current().record("client_addr", field::display(client_leg.peer_addr()));

        let client = match cancellable(
            cancel,
            SessionStage::ClientHandshake,
            client_leg.handshake(&self.store, TlsRole::Accept, settings.handshake_timeout),
        )
        .await?
        {
            Ok(client) => client,
            Err(error) => {
                server.close(settings.close_timeout).await;
                return Err(SessionError::ClientHandshake(error));
            }
        };
        self.timeline.client_established = Some(client.established_at());
        self.client = Some(client.identity().clone());
        tracing::Span::current().record("client", client.identity().common_name());
        tracing::info!("Client leg established; relaying");

        let transferred = cancellable(
            cancel,
            SessionStage::Relay,
            relay(&settings.forwarder, server, client),
        )
        .await??;

        Ok(transferred)
    }

    /// Queue up for a client leg and wait for the client listener to deliver one.
    async fn await_client(
        &self,
        clients: &mpsc::Sender<ClientWaiter>,
        cancel: &CancellationToken,
    ) -> Result<PendingLeg, SessionError> {
        let timeout = self.settings.client_timeout;
        let (waiter, mut delivery) = oneshot::channel();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled(SessionStage::AwaitingClient)),
            outcome = tokio::time::timeout(timeout, async {
                clients
                    .send(waiter)
                    .await
                    .map_err(|_| SessionError::Cancelled(SessionStage::AwaitingClient))?;
                (&mut delivery)
                    .await
                    .map_err(|_| SessionError::Cancelled(SessionStage::AwaitingClient))
            }) => outcome.unwrap_or(Err(SessionError::ClientTimeout(timeout))),
        };

        if let Err(SessionError::ClientTimeout(_)) = &outcome {
            // A client may have been handed over right as the timeout fired; don't strand it.
            delivery.close();
            if let Ok(client_leg) = delivery.try_recv() {
                return Ok(client_leg);
            }
        }
        outcome
    }

    fn report(self, result: Result<Transferred, SessionError>) -> SessionReport {
        let server = self.server.as_ref().map(|identity| identity.common_name());
        let client = self.client.as_ref().map(|identity| identity.common_name());
        let (status, failed_stage, error, transferred) = match result {
            Ok(transferred) => {
                tracing::info!(
                    status = %SessionStatus::Completed,
                    server,
                    client,
                    server_sent_bytes = transferred.server_to_client,
                    client_sent_bytes = transferred.client_to_server,
                    "Session completed"
                );
                (SessionStatus::Completed, None, None, transferred)
            }
            Err(error) => {
                let status = error.status();
                let stage = error.stage();
                if status == SessionStatus::Cancelled {
                    tracing::info!(%status, %stage, server, client, "Session cancelled");
                } else {
                    tracing::warn!(%status, %stage, server, client, %error, "Session failed");
                }
                (
                    status,
                    Some(stage),
                    Some(error.to_string()),
                    Transferred::default(),
                )
            }
        };

        SessionReport {
            session_id: self.id,
            status,
            failed_stage,
            error,
            server_addr: self.server_addr,
            client_addr: self.client_addr,
            server: self.server,
            client: self.client,
            transferred,
            timeline: self.timeline,
        }
    }
}

async fn relay(
    forwarder: &Forwarder,
    server: Leg,
    client: Leg,
) -> Result<Transferred, SessionError> {
    Ok(forwarder
        .relay(server.into_stream(), client.into_stream())
        .await?)
}

/// Run `future` unless the session is cancelled first.
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    stage: SessionStage,
    future: F,
) -> Result<F::Output, SessionError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled(stage)),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names() {
        let names = [
            (SessionStatus::Completed, "completed"),
            (SessionStatus::ServerHandshakeFailed, "server-handshake-failed"),
            (SessionStatus::ClientTimeout, "client-timeout"),
            (SessionStatus::ClientHandshakeFailed, "client-handshake-failed"),
            (SessionStatus::RelayError, "relay-error"),
            (SessionStatus::Cancelled, "cancelled"),
        ];
        for (status, name) in names {
            assert_eq!(name, status.to_string());
        }
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, SessionStage::Relay, std::future::pending::<()>()).await;
        assert!(matches!(
            result,
            Err(SessionError::Cancelled(SessionStage::Relay))
        ));
    }

    #[tokio::test]
    async fn uncancelled_future_completes() {
        let cancel = CancellationToken::new();
        let result = cancellable(&cancel, SessionStage::Relay, async { 42 }).await;
        assert!(matches!(result, Ok(42)));
    }
}
