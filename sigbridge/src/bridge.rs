// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The bridge listeners and session lifecycle management.
//!
//! Two accept loops run independently. The server loop starts a new [`Session`] for every
//! connection it accepts. The client loop hands connections to whichever session has been
//! waiting longest for a client; sessions only start waiting once their server leg has
//! completed its handshake.

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    config::{Credentials, TlsVersion},
    handshake::{LegRole, PendingLeg},
    relay::Forwarder,
    session::{ClientWaiter, Session, SessionReport, SessionSettings},
    tls::{CertificateStore, TlsRole},
};

// Sessions waiting for a client beyond this many block until others are served.
const CLIENT_QUEUE_DEPTH: usize = 128;
const REPORT_BUFFER: usize = 1024;

/// Configuration for the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The socket address to listen on for incoming connections from signing servers.
    ///
    /// The default is to listen on all interfaces on port 44333.
    pub server_listening_address: SocketAddr,
    /// The socket address to listen on for incoming connections from signing clients.
    ///
    /// The default is to listen on all interfaces on port 44334.
    pub client_listening_address: SocketAddr,
    /// The oldest TLS version to negotiate with servers and clients.
    pub min_tls_version: TlsVersion,
    /// The newest TLS version to negotiate with servers and clients.
    pub max_tls_version: TlsVersion,
    /// The TLS role the bridge plays on connections from servers.
    ///
    /// With "accept" (the default) the server is the TLS client. With "connect" the server
    /// opens the TCP connection but acts as the TLS server. Client connections always use
    /// "accept".
    pub server_leg_tls_role: TlsRole,
    /// The size, in bytes, of the transfer buffer used for each relay direction.
    pub relay_buffer_size: usize,
    /// How long a single TLS handshake may take before the connection is dropped.
    pub handshake_timeout: Duration,
    /// How long a session waits for a client after its server leg is established.
    ///
    /// The server is disconnected with a TLS `close_notify` when this elapses. The default is
    /// 30 seconds.
    pub client_timeout: Duration,
    /// When a relay ends, how long the bridge spends closing the leg that finished first
    /// before dropping its connection.
    pub drain_timeout: Duration,
    /// After shutdown begins, how long in-flight sessions may run before being cancelled.
    pub shutdown_grace_period: Duration,
    /// How long to pause after a failed accept before accepting again.
    pub accept_retry_delay: Duration,
    /// The TLS credentials for the server and client listeners.
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_listening_address: SocketAddr::from_str("[::]:44333")
                .expect("the default should be valid"),
            client_listening_address: SocketAddr::from_str("[::]:44334")
                .expect("the default should be valid"),
            min_tls_version: TlsVersion::Tls13,
            max_tls_version: TlsVersion::Tls13,
            server_leg_tls_role: TlsRole::Accept,
            relay_buffer_size: 1024 * 64,
            handshake_timeout: Duration::from_secs(10),
            client_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(30),
            accept_retry_delay: Duration::from_millis(100),
            credentials: Credentials {
                private_key: "sigul.bridge.private_key.pem".into(),
                certificate: "sigul.bridge.certificate.pem".into(),
                ca_certificate: "sigul.ca_certificate.pem".into(),
                ca_private_key: None,
            },
        }
    }
}

#[cfg(feature = "cli")]
impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl Config {
    /// Check the configuration for values the bridge can't run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_tls_version > self.max_tls_version {
            return Err(anyhow::anyhow!(
                "min_tls_version ({:?}) is newer than max_tls_version ({:?})",
                self.min_tls_version,
                self.max_tls_version
            ));
        }
        if self.relay_buffer_size == 0 {
            return Err(anyhow::anyhow!("relay_buffer_size must be greater than 0"));
        }
        for (name, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("client_timeout", self.client_timeout),
            ("drain_timeout", self.drain_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow::anyhow!("{name} must be greater than 0"));
            }
        }
        if self.server_listening_address == self.client_listening_address
            && self.server_listening_address.port() != 0
        {
            return Err(anyhow::anyhow!(
                "the server and client listeners can't share the address {}",
                self.server_listening_address
            ));
        }

        Ok(())
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            server_leg_tls_role: self.server_leg_tls_role,
            handshake_timeout: self.handshake_timeout,
            client_timeout: self.client_timeout,
            close_timeout: self.handshake_timeout,
            forwarder: Forwarder::new(self.relay_buffer_size, self.drain_timeout),
        }
    }
}

/// Whether an accept error is expected to clear up on its own.
///
/// These are the errors caused by resource exhaustion or by a peer giving up on a connection
/// before it was accepted. The listener retries every error, but anything not in this list
/// likely needs an operator's attention.
pub fn is_transient_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::OutOfMemory
    ) {
        return true;
    }

    rustix::io::Errno::from_io_error(error).is_some_and(|errno| {
        [
            rustix::io::Errno::MFILE,
            rustix::io::Errno::NFILE,
            rustix::io::Errno::NOBUFS,
            rustix::io::Errno::NOMEM,
            rustix::io::Errno::PROTO,
        ]
        .contains(&errno)
    })
}

/// Accept the next TCP connection, retrying through errors.
async fn accept_tcp(
    tcp_listener: &TcpListener,
    role: LegRole,
    retry_delay: Duration,
) -> (TcpStream, SocketAddr) {
    loop {
        match tcp_listener.accept().await {
            Ok((tcp_stream, peer_addr)) => {
                tracing::debug!(%role, ?peer_addr, "New TCP connection established");
                return (tcp_stream, peer_addr);
            }
            Err(error) if is_transient_accept_error(&error) => {
                tracing::warn!(%role, ?error, "Failed to accept connection; retrying");
            }
            Err(error) => {
                tracing::error!(%role, ?error, "Unexpected error accepting connection; retrying");
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}

/// Hand client connections to sessions, oldest waiting session first.
///
/// Connections are only accepted while a session is waiting for one. If that session gives up
/// before the connection arrives, the connection goes to the next session to wait, provided one
/// does within `client_timeout` of the accept; otherwise the connection is dropped.
async fn accept_clients(
    client_listener: TcpListener,
    mut waiters: mpsc::Receiver<ClientWaiter>,
    halt_token: CancellationToken,
    retry_delay: Duration,
    client_timeout: Duration,
) {
    'accept: loop {
        let waiter = tokio::select! {
            _ = halt_token.cancelled() => break 'accept,
            waiter = waiters.recv() => match waiter {
                Some(waiter) => waiter,
                None => break 'accept,
            },
        };
        if waiter.is_closed() {
            tracing::trace!("Session stopped waiting for a client before one arrived");
            continue;
        }

        let (tcp_stream, peer_addr) = tokio::select! {
            _ = halt_token.cancelled() => break 'accept,
            conn = accept_tcp(&client_listener, LegRole::ClientLeg, retry_delay) => conn,
        };
        let mut client_leg = PendingLeg::new(LegRole::ClientLeg, tcp_stream, peer_addr);
        let deadline = client_leg.accepted_at() + client_timeout;
        let mut waiter = waiter;
        while let Err(returned) = waiter.send(client_leg) {
            tracing::debug!(
                ?peer_addr,
                "Session gave up waiting; handing the client to the next session"
            );
            client_leg = returned;
            waiter = tokio::select! {
                _ = halt_token.cancelled() => break 'accept,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(
                        ?peer_addr,
                        ?client_timeout,
                        "No session took the client in time; closing the connection"
                    );
                    continue 'accept;
                },
                waiter = waiters.recv() => match waiter {
                    Some(waiter) => waiter,
                    None => break 'accept,
                },
            };
        }
    }

    tracing::info!("Shutdown requested, no new clients will be accepted");
}

async fn inner_listen(
    config: Config,
    store: Arc<CertificateStore>,
    halt_token: CancellationToken,
    client_listener: TcpListener,
    server_listener: TcpListener,
    reports: broadcast::Sender<SessionReport>,
) -> anyhow::Result<()> {
    let settings = Arc::new(config.session_settings());
    let request_tracker = TaskTracker::new();
    // Cancels sessions that outlive the shutdown grace period.
    let session_cancel = CancellationToken::new();
    let (waiters_tx, waiters_rx) = mpsc::channel::<ClientWaiter>(CLIENT_QUEUE_DEPTH);

    let client_acceptor = tokio::spawn(
        accept_clients(
            client_listener,
            waiters_rx,
            halt_token.clone(),
            config.accept_retry_delay,
            config.client_timeout,
        )
        .instrument(tracing::Span::current()),
    );

    'accept: loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::info!("Shutdown requested, no new sessions will be started");
                break 'accept;
            },
            conn = accept_tcp(&server_listener, LegRole::ServerLeg, config.accept_retry_delay) => conn,
        };

        let server_leg = PendingLeg::new(LegRole::ServerLeg, tcp_stream, peer_addr);
        let session = Session::new(store.clone(), settings.clone(), &server_leg);
        let clients = waiters_tx.clone();
        let cancel = session_cancel.clone();
        let reports = reports.clone();
        request_tracker.spawn(
            async move {
                let report = session.run(server_leg, clients, cancel).await;
                // Nobody listening for reports is fine.
                let _ = reports.send(report);
            }
            .instrument(tracing::Span::current()),
        );
    }

    // Sessions still waiting for a client are cancelled once the client acceptor drops the queue.
    drop(waiters_tx);
    client_acceptor.await?;

    request_tracker.close();
    let grace_period = config.shutdown_grace_period;
    if tokio::time::timeout(grace_period, request_tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            sessions = request_tracker.len(),
            ?grace_period,
            "Shutdown grace period elapsed; cancelling in-flight sessions"
        );
        session_cancel.cancel();
        request_tracker.wait().await;
    }
    tracing::info!("All sessions are now complete");

    Ok(())
}

pub struct Listener {
    /// The socket address client connections are expected to arrive on. This is primarily
    /// useful for tests when binding to port 0.
    client_addr: SocketAddr,
    /// The socket address server connections are expected to arrive on. This is primarily
    /// useful for tests when binding to port 0.
    server_addr: SocketAddr,
    /// A task that is accepting incoming connections. Once the [`CancellationToken`] provided
    /// to the [`listen`] function has been cancelled, this task will complete once all existing
    /// sessions complete or the shutdown grace period elapses.
    task: tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    halt_token: CancellationToken,
    reports: broadcast::Sender<SessionReport>,
}

impl Listener {
    /// Get the port number the bridge is listening on for client connections.
    pub fn client_port(&self) -> u16 {
        self.client_addr.port()
    }

    /// Get the port number the bridge is listening on for server connections.
    pub fn server_port(&self) -> u16 {
        self.server_addr.port()
    }

    /// Subscribe to the reports of sessions that end from now on.
    ///
    /// Subscribers that fall more than a thousand reports behind miss the oldest ones.
    pub fn session_reports(&self) -> broadcast::Receiver<SessionReport> {
        self.reports.subscribe()
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await?
    }

    /// Stop accepting new connections and wait for existing sessions to complete.
    ///
    /// Sessions still running after the configured shutdown grace period are cancelled.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }
}

/// Act as a bridge on the configured socket addresses.
///
/// This function returns once the certificate store has been loaded and the server and client
/// TCP listeners have been established.
///
/// # Errors
///
/// An invalid configuration, an unusable certificate store, or a listening address that can't
/// be bound is an error; the bridge can't start without operator intervention.
#[instrument(skip_all, err)]
pub async fn listen(config: Config) -> anyhow::Result<Listener> {
    config.validate()?;
    let store = CertificateStore::load(
        &config.credentials,
        config.min_tls_version,
        config.max_tls_version,
    )
    .context("failed to load the certificate store")?;
    tracing::info!(
        identity = store.identity().common_name(),
        holds_ca_private_key = store.holds_ca_private_key(),
        "Certificate store loaded"
    );

    let server_listener = TcpListener::bind(config.server_listening_address)
        .await
        .with_context(|| {
            format!(
                "failed to bind the server listener to {}",
                config.server_listening_address
            )
        })?;
    let client_listener = TcpListener::bind(config.client_listening_address)
        .await
        .with_context(|| {
            format!(
                "failed to bind the client listener to {}",
                config.client_listening_address
            )
        })?;
    let client_addr = client_listener.local_addr()?;
    let server_addr = server_listener.local_addr()?;
    tracing::info!(%server_addr, %client_addr, "Bridge listening");

    let halt_token = CancellationToken::new();
    let (reports, _) = broadcast::channel(REPORT_BUFFER);

    let task = tokio::spawn(
        inner_listen(
            config,
            Arc::new(store),
            halt_token.clone(),
            client_listener,
            server_listener,
            reports.clone(),
        )
        .instrument(tracing::Span::current()),
    );
    Ok(Listener {
        client_addr,
        server_addr,
        task,
        halt_token,
        reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() -> anyhow::Result<()> {
        let config = Config::default();
        config.validate()?;
        assert_eq!(44333, config.server_listening_address.port());
        assert_eq!(44334, config.client_listening_address.port());
        assert_eq!(Duration::from_secs(30), config.client_timeout);
        Ok(())
    }

    #[test]
    fn inverted_tls_versions_are_rejected() {
        let config = Config {
            min_tls_version: TlsVersion::Tls13,
            max_tls_version: TlsVersion::Tls12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = Config {
            client_timeout: Duration::ZERO,
            ..Default::default()
        };
        let error = config.validate().expect_err("zero timeout is invalid");
        assert!(error.to_string().contains("client_timeout"));

        let config = Config {
            relay_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_listening_address_is_rejected() {
        let config = Config {
            client_listening_address: SocketAddr::from_str("[::]:44333").unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn transient_accept_errors() {
        use std::io::{Error, ErrorKind};

        assert!(is_transient_accept_error(&Error::from(
            ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&Error::from(
            ErrorKind::Interrupted
        )));
        assert!(is_transient_accept_error(
            &rustix::io::Errno::MFILE.into()
        ));
        assert!(is_transient_accept_error(
            &rustix::io::Errno::NOBUFS.into()
        ));
        assert!(!is_transient_accept_error(&Error::from(
            ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(
            &rustix::io::Errno::BADF.into()
        ));
    }

    struct ClientAcceptor {
        address: SocketAddr,
        waiters: mpsc::Sender<ClientWaiter>,
        halt_token: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_client_acceptor(client_timeout: Duration) -> anyhow::Result<ClientAcceptor> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let (waiters, waiters_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let halt_token = CancellationToken::new();
        let task = tokio::spawn(accept_clients(
            listener,
            waiters_rx,
            halt_token.clone(),
            Duration::from_millis(10),
            client_timeout,
        ));
        Ok(ClientAcceptor {
            address,
            waiters,
            halt_token,
            task,
        })
    }

    // A session that gives up mid-accept doesn't leave its client connected and unhandshaked.
    #[tokio::test]
    #[tracing_test::traced_test]
    async fn unclaimed_client_is_dropped() -> anyhow::Result<()> {
        use tokio::io::AsyncReadExt;

        let acceptor = start_client_acceptor(Duration::from_millis(300)).await?;
        let (waiter, abandoned) = tokio::sync::oneshot::channel();
        acceptor.waiters.send(waiter).await?;
        // Let the acceptor start accepting on the waiter's behalf before it gives up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(abandoned);

        let mut client = TcpStream::connect(acceptor.address).await?;
        let mut buf = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await?;
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");

        acceptor.halt_token.cancel();
        acceptor.task.await?;
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn client_goes_to_the_next_waiting_session() -> anyhow::Result<()> {
        let acceptor = start_client_acceptor(Duration::from_secs(5)).await?;
        let (waiter, abandoned) = tokio::sync::oneshot::channel();
        acceptor.waiters.send(waiter).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(abandoned);

        let client = TcpStream::connect(acceptor.address).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (waiter, next_session) = tokio::sync::oneshot::channel();
        acceptor.waiters.send(waiter).await?;
        let client_leg = tokio::time::timeout(Duration::from_secs(5), next_session).await??;
        assert_eq!(client.local_addr()?, client_leg.peer_addr());

        acceptor.halt_token.cancel();
        acceptor.task.await?;
        Ok(())
    }

    #[cfg(feature = "cli")]
    #[test]
    fn partial_config_file_uses_defaults() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            client_timeout = { secs = 5, nanos = 0 }
            server_leg_tls_role = "connect"
            min_tls_version = "1.2"

            [credentials]
            private_key = "bridge.key.pem"
            certificate = "bridge.cert.pem"
            ca_certificate = "ca.pem"
            ca_private_key = "ca.key.pem"
            "#,
        )?;

        assert_eq!(Duration::from_secs(5), config.client_timeout);
        assert_eq!(TlsRole::Connect, config.server_leg_tls_role);
        assert_eq!(TlsVersion::Tls12, config.min_tls_version);
        assert_eq!(TlsVersion::Tls13, config.max_tls_version);
        assert_eq!(Duration::from_secs(10), config.handshake_timeout);
        assert_eq!(
            Some(std::path::PathBuf::from("ca.key.pem")),
            config.credentials.ca_private_key
        );
        config.validate()?;
        Ok(())
    }

    #[cfg(feature = "cli")]
    #[test]
    fn config_round_trips_through_display() -> anyhow::Result<()> {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_string())?;
        assert_eq!(config.server_listening_address, parsed.server_listening_address);
        assert_eq!(config.client_timeout, parsed.client_timeout);
        assert_eq!(config.credentials.certificate, parsed.credentials.certificate);
        Ok(())
    }
}
