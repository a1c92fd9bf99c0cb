// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Sigbridge

Sigbridge is the relay that sits between signing servers and signing clients. Neither side
ever has a direct network path to the other: the server is designed such that the host firewall
can drop all incoming traffic, so it dials out to the bridge, and clients dial in to the bridge
from the other side.

The bridge accepts connections on two ports, one for servers and one for clients. Both legs are
authenticated with mutual TLS against the same certificate authority, and the bridge then ferries
opaque bytes between the two connections until one side is done. The bridge never interprets the
traffic it relays.

## Handshake ordering

The server leg's TLS handshake is driven to completion the moment the server connection is
accepted, *before* the bridge starts waiting for a client. A server whose handshake is left
pending while the bridge waits for a client will eventually time out or be reset by its peer,
and that failure shows up later as a confusing end-of-file. See [`handshake`] and [`session`].

## Crate features

* **cli** -
  Include the `sigbridge` CLI and the configuration file helpers. This is a default feature.
*/

pub mod bridge;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod relay;
pub mod session;
pub mod tls;
