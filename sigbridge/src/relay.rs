// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Protocol-agnostic forwarding between two established legs.
//!
//! Bytes are copied in both directions through a fixed-size buffer per direction; nothing is
//! parsed or framed. The first side to finish sending ends the relay: its end of stream is
//! passed on to the other peer, the remaining direction stops, and both legs are closed. Any
//! error in either direction ends the relay immediately.

use std::{fmt::Display, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

/// The direction bytes flow through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ServerToClient,
    ClientToServer,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ServerToClient => write!(f, "server to client"),
            Direction::ClientToServer => write!(f, "client to server"),
        }
    }
}

/// Byte counts for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub server_to_client: u64,
    pub client_to_server: u64,
}

/// Copies bytes between a server leg and a client leg.
#[derive(Debug, Clone, Copy)]
pub struct Forwarder {
    buffer_size: usize,
    close_timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder using a `buffer_size` transfer buffer for each direction.
    ///
    /// When the relay ends, closing the leg that finished first may take at most
    /// `close_timeout` before its connection is dropped regardless.
    pub fn new(buffer_size: usize, close_timeout: Duration) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            close_timeout,
        }
    }

    /// Relay bytes between `server` and `client` until either side finishes sending.
    ///
    /// Both streams are consumed and dropped when this returns, whatever the outcome. Bytes the
    /// other side was still sending when the relay ended are discarded.
    ///
    /// # Errors
    ///
    /// If reading or writing fails in either direction before one of them reaches the end of its
    /// stream, an error is returned and both streams are closed.
    pub async fn relay<S, C>(&self, server: S, client: C) -> Result<Transferred, RelayError>
    where
        S: AsyncRead + AsyncWrite,
        C: AsyncRead + AsyncWrite,
    {
        let (mut server_rx, mut server_tx) = tokio::io::split(server);
        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        let mut downstream_buffer = vec![0_u8; self.buffer_size];
        let mut upstream_buffer = vec![0_u8; self.buffer_size];
        let mut transferred = Transferred::default();

        let ended = {
            let downstream = pipe(
                &mut server_rx,
                &mut client_tx,
                &mut downstream_buffer,
                Direction::ServerToClient,
                &mut transferred.server_to_client,
            );
            let upstream = pipe(
                &mut client_rx,
                &mut server_tx,
                &mut upstream_buffer,
                Direction::ClientToServer,
                &mut transferred.client_to_server,
            );
            tokio::pin!(downstream, upstream);

            tokio::select! {
                result = &mut downstream => result.map(|()| Direction::ServerToClient),
                result = &mut upstream => result.map(|()| Direction::ClientToServer),
            }
        }?;

        // The remaining direction is dropped above; the peer that finished first is closed too.
        let close_first_to_finish = async {
            match ended {
                Direction::ServerToClient => server_tx.shutdown().await,
                Direction::ClientToServer => client_tx.shutdown().await,
            }
        };
        match tokio::time::timeout(self.close_timeout, close_first_to_finish).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(?error, "Failed to close the leg that finished first");
            }
            Err(_) => {
                tracing::debug!(timeout = ?self.close_timeout, "Timed out closing the leg that finished first");
            }
        }
        tracing::debug!(
            direction = %ended,
            server_to_client = transferred.server_to_client,
            client_to_server = transferred.client_to_server,
            "Relay ended"
        );

        Ok(transferred)
    }
}

/// Copy from `reader` to `writer` until `reader` reaches the end of its stream, then close
/// `writer`.
///
/// Bytes are counted into `total` as soon as they're read.
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut [u8],
    direction: Direction,
    total: &mut u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let error = |source| RelayError::Io { direction, source };
    loop {
        let read = reader.read(buffer).await.map_err(error)?;
        if read == 0 {
            writer.shutdown().await.map_err(error)?;
            tracing::debug!(%direction, bytes = *total, "Source reached end of stream; destination closed");
            return Ok(());
        }
        *total += read as u64;
        writer.write_all(&buffer[..read]).await.map_err(error)?;
        writer.flush().await.map_err(error)?;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::ErrorKind,
        pin::Pin,
        task::{Context, Poll},
    };

    use proptest::prelude::*;
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    use super::*;

    struct Peers {
        server: DuplexStream,
        client: DuplexStream,
        relay: tokio::task::JoinHandle<Result<Transferred, RelayError>>,
    }

    fn start(forwarder: Forwarder) -> Peers {
        let (server, server_leg) = duplex(1024);
        let (client, client_leg) = duplex(1024);
        let relay = tokio::spawn(async move { forwarder.relay(server_leg, client_leg).await });
        Peers {
            server,
            client,
            relay,
        }
    }

    // A request goes up, the server responds and closes, and the relay ends.
    #[tokio::test]
    async fn request_response() -> anyhow::Result<()> {
        let Peers {
            mut server,
            mut client,
            relay,
        } = start(Forwarder::new(16, Duration::from_secs(5)));

        client.write_all(b"sign this please").await?;
        let mut request = [0_u8; 16];
        server.read_exact(&mut request).await?;
        assert_eq!(b"sign this please", &request);

        server.write_all(b"signed").await?;
        server.shutdown().await?;

        let mut response = vec![];
        client.read_to_end(&mut response).await?;
        assert_eq!(b"signed".as_slice(), response);

        let transferred = relay.await??;
        assert_eq!(
            Transferred {
                server_to_client: 6,
                client_to_server: 16
            },
            transferred
        );
        Ok(())
    }

    // When one side closes, both peers see the end of the stream.
    #[tokio::test]
    async fn close_propagates() -> anyhow::Result<()> {
        let Peers {
            mut server,
            mut client,
            relay,
        } = start(Forwarder::new(1024, Duration::from_secs(5)));

        server.shutdown().await?;
        let mut buf = [0_u8; 8];
        assert_eq!(0, client.read(&mut buf).await?);
        assert_eq!(0, server.read(&mut buf).await?);

        assert_eq!(Transferred::default(), relay.await??);
        Ok(())
    }

    // A client that keeps its side open after reading the response doesn't hold the relay open.
    #[tokio::test]
    async fn remaining_direction_is_closed_promptly() -> anyhow::Result<()> {
        let Peers {
            mut server,
            mut client,
            relay,
        } = start(Forwarder::new(1024, Duration::from_secs(30)));

        server.write_all(b"response").await?;
        server.shutdown().await?;

        let mut response = vec![];
        client.read_to_end(&mut response).await?;
        assert_eq!(b"response".as_slice(), response);

        let transferred = tokio::time::timeout(Duration::from_secs(1), relay).await???;
        assert_eq!(
            Transferred {
                server_to_client: 8,
                client_to_server: 0
            },
            transferred
        );

        // Both legs are gone: the client can't be heard and the server sees the end of stream.
        let mut buf = [0_u8; 8];
        assert_eq!(0, server.read(&mut buf).await?);
        assert!(client.write_all(b"still here").await.is_err());
        Ok(())
    }

    /// A peer that never sends anything and refuses every write.
    struct Unwritable;

    impl AsyncRead for Unwritable {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for Unwritable {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_is_an_error() -> anyhow::Result<()> {
        let (mut client, client_leg) = duplex(1024);
        let forwarder = Forwarder::new(1024, Duration::from_secs(5));
        let relay = tokio::spawn(async move { forwarder.relay(Unwritable, client_leg).await });

        client.write_all(b"is anyone there?").await?;

        match relay.await? {
            Err(RelayError::Io { direction, source }) => {
                assert_eq!(Direction::ClientToServer, direction);
                assert_eq!(ErrorKind::BrokenPipe, source.kind());
            }
            other => panic!("Expected a relay error, got {other:?}"),
        }
        let mut buf = [0_u8; 8];
        assert_eq!(0, client.read(&mut buf).await?);
        Ok(())
    }

    proptest! {
        // Whatever chunking the peers write with, each side receives exactly what the other sent.
        #[test]
        fn relay_is_byte_exact(
            upstream in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..20),
            downstream in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..20),
            buffer_size in 1_usize..128,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            runtime.block_on(async {
                let Peers { mut server, mut client, relay } =
                    start(Forwarder::new(buffer_size, Duration::from_secs(5)));

                let expected_up = upstream.concat();
                let expected_down = downstream.concat();
                let client_side = async {
                    for chunk in &upstream {
                        client.write_all(chunk).await?;
                    }
                    let mut received = vec![];
                    client.read_to_end(&mut received).await?;
                    Ok::<_, std::io::Error>(received)
                };
                let server_side = async {
                    let mut received = vec![0_u8; expected_up.len()];
                    server.read_exact(&mut received).await?;
                    for chunk in &downstream {
                        server.write_all(chunk).await?;
                    }
                    server.shutdown().await?;
                    Ok::<_, std::io::Error>(received)
                };

                let (received_by_client, received_by_server) =
                    tokio::try_join!(client_side, server_side).unwrap();
                let transferred = relay.await.unwrap().unwrap();

                prop_assert_eq!(&expected_up, &received_by_server);
                prop_assert_eq!(&expected_down, &received_by_client);
                prop_assert_eq!(expected_up.len() as u64, transferred.client_to_server);
                prop_assert_eq!(expected_down.len() as u64, transferred.server_to_client);
                Ok(())
            })?;
        }
    }
}
