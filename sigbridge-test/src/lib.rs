// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing the bridge: a throwaway certificate authority with credentials for
//! every role, and TLS peers that play the server and client parts against a running bridge.

use std::{
    net::SocketAddr,
    path::Path,
    pin::Pin,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    ssl::{Ssl, SslAcceptor, SslConnector, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode},
    x509::{
        extension::{
            BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
            SubjectKeyIdentifier,
        },
        X509Builder, X509Name, X509NameBuilder, X509,
    },
};
use sigbridge::{bridge, config::Credentials, session::SessionReport};
use tokio::{net::TcpStream, sync::broadcast};
use tokio_openssl::SslStream;
use tracing::Instrument;

/// The hostname peers expect the bridge certificate to be valid for.
pub const BRIDGE_HOSTNAME: &str = "localhost";
pub const SERVER_NAME: &str = "sigbridge-server";
pub const CLIENT_NAME: &str = "sigbridge-client";

const DAY: i64 = 60 * 60 * 24;

#[derive(Clone, Debug)]
pub struct Creds {
    pub bridge: Credentials,
    pub server: Credentials,
    pub client: Credentials,
    /// A server certificate issued by a certificate authority the bridge doesn't trust.
    pub rogue_server: Credentials,
    /// A client certificate issued by a certificate authority the bridge doesn't trust.
    pub rogue_client: Credentials,
    /// A client certificate from the trusted authority that carries no common name.
    pub nameless_client: Credentials,
    /// A client certificate from the trusted authority that expired yesterday.
    pub expired_client: Credentials,
}

enum Validity {
    Current,
    Expired,
}

struct Authority {
    key: PKey<Private>,
    certificate: X509,
}

impl Authority {
    fn new(common_name: &str) -> anyhow::Result<Self> {
        let key = generate_key()?;
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_pubkey(&key)?;
        set_serial_number(&mut builder)?;
        let name = subject_name(Some(common_name))?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        let subj_key_id = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(subj_key_id)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            key,
            certificate: builder.build(),
        })
    }

    /// Issue a leaf certificate usable for both ends of a TLS connection.
    fn issue(
        &self,
        common_name: Option<&str>,
        hostname: Option<&str>,
        validity: Validity,
    ) -> anyhow::Result<(PKey<Private>, X509)> {
        let key = generate_key()?;
        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        builder.set_pubkey(&key)?;
        set_serial_number(&mut builder)?;
        let name = subject_name(common_name)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.certificate.subject_name())?;
        match validity {
            Validity::Current => {
                builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
                builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
            }
            Validity::Expired => {
                let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
                builder.set_not_before(Asn1Time::from_unix(now - 2 * DAY)?.as_ref())?;
                builder.set_not_after(Asn1Time::from_unix(now - DAY)?.as_ref())?;
            }
        }
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        builder.append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()?,
        )?;
        if let Some(hostname) = hostname {
            let alt_names = SubjectAlternativeName::new()
                .dns(hostname)
                .ip("127.0.0.1")
                .build(&builder.x509v3_context(Some(&self.certificate), None))?;
            builder.append_extension(alt_names)?;
        }
        let subj_key_id = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(&self.certificate), None))?;
        builder.append_extension(subj_key_id)?;
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok((key, builder.build()))
    }
}

fn generate_key() -> anyhow::Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

fn set_serial_number(builder: &mut X509Builder) -> anyhow::Result<()> {
    let mut serial_number = [0; 16];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    builder.set_serial_number(Asn1Integer::from_bn(&serial_number)?.as_ref())?;
    Ok(())
}

fn subject_name(common_name: Option<&str>) -> anyhow::Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "sigbridge tests")?;
    if let Some(common_name) = common_name {
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    }
    Ok(name.build())
}

/// Generate a set of credentials in the `creds/` sub-directory of the given directory.
///
/// Every set of credentials except the bridge's trusts the test authority, so handshake
/// failures involving the rogue, nameless, or expired certificates are always the bridge
/// rejecting the peer.
pub fn create_credentials(dir: &Path) -> anyhow::Result<Creds> {
    let creds_directory = dir.join("creds");
    std::fs::create_dir_all(&creds_directory)?;

    let ca = Authority::new("sigbridge test CA")?;
    let rogue_ca = Authority::new("sigbridge rogue CA")?;

    let ca_certificate = creds_directory.join("sigul.ca_certificate.pem");
    std::fs::write(&ca_certificate, ca.certificate.to_pem()?)?;
    let ca_private_key = creds_directory.join("sigul.ca.private_key.pem");
    std::fs::write(&ca_private_key, ca.key.private_key_to_pem_pkcs8()?)?;

    let write = |name: &str, (key, certificate): (PKey<Private>, X509)| -> anyhow::Result<Credentials> {
        let private_key = creds_directory.join(format!("sigul.{name}.private_key.pem"));
        std::fs::write(&private_key, key.private_key_to_pem_pkcs8()?)?;
        let certificate_path = creds_directory.join(format!("sigul.{name}.certificate.pem"));
        std::fs::write(&certificate_path, certificate.to_pem()?)?;
        Ok(Credentials {
            private_key,
            certificate: certificate_path,
            ca_certificate: ca_certificate.clone(),
            ca_private_key: None,
        })
    };

    let mut bridge = write(
        "bridge",
        ca.issue(Some(BRIDGE_HOSTNAME), Some(BRIDGE_HOSTNAME), Validity::Current)?,
    )?;
    bridge.ca_private_key = Some(ca_private_key);

    Ok(Creds {
        bridge,
        server: write("server", ca.issue(Some(SERVER_NAME), None, Validity::Current)?)?,
        client: write("client", ca.issue(Some(CLIENT_NAME), None, Validity::Current)?)?,
        rogue_server: write(
            "rogue_server",
            rogue_ca.issue(Some(SERVER_NAME), None, Validity::Current)?,
        )?,
        rogue_client: write(
            "rogue_client",
            rogue_ca.issue(Some(CLIENT_NAME), None, Validity::Current)?,
        )?,
        nameless_client: write("nameless_client", ca.issue(None, None, Validity::Current)?)?,
        expired_client: write(
            "expired_client",
            ca.issue(Some(CLIENT_NAME), None, Validity::Expired)?,
        )?,
    })
}

fn use_credentials(builder: &mut SslContextBuilder, creds: &Credentials) -> anyhow::Result<()> {
    builder.set_private_key_file(&creds.private_key, SslFiletype::PEM)?;
    builder.set_certificate_file(&creds.certificate, SslFiletype::PEM)?;
    builder.check_private_key()?;
    builder.set_ca_file(&creds.ca_certificate)?;
    Ok(())
}

/// Connect to the bridge as a TLS client presenting `creds`.
///
/// With TLS 1.3 the client finishes its side of the handshake before the bridge has checked
/// the client's certificate, so a rejected peer may only notice on its first read.
pub async fn connect(creds: &Credentials, port: u16) -> anyhow::Result<SslStream<TcpStream>> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    use_credentials(&mut connector, creds)?;
    tls_connect(connector.build(), port).await
}

/// Connect to the bridge as a TLS client without presenting a certificate.
pub async fn connect_without_certificate(
    ca_certificate: &Path,
    port: u16,
) -> anyhow::Result<SslStream<TcpStream>> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    connector.set_ca_file(ca_certificate)?;
    tls_connect(connector.build(), port).await
}

async fn tls_connect(connector: SslConnector, port: u16) -> anyhow::Result<SslStream<TcpStream>> {
    let tcp_stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let ssl = connector.configure()?.into_ssl(BRIDGE_HOSTNAME)?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .context("TLS handshake with the bridge failed")?;
    Ok(stream)
}

/// Open a TCP connection to the bridge and act as the TLS server on it.
///
/// This is how a server peer connects when the bridge is configured to connect on the server leg.
pub async fn connect_and_accept(
    creds: &Credentials,
    port: u16,
) -> anyhow::Result<SslStream<TcpStream>> {
    let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
    acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    use_credentials(&mut acceptor, creds)?;
    let acceptor = acceptor.build();

    let tcp_stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .context("TLS handshake with the bridge failed")?;
    Ok(stream)
}

/// Wait for the next session report, giving up after ten seconds.
pub async fn next_report(
    reports: &mut broadcast::Receiver<SessionReport>,
) -> anyhow::Result<SessionReport> {
    tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .context("no session report arrived in time")?
        .context("the report channel closed")
}

/// A random duration between zero and `max`.
pub fn random_delay(max: Duration) -> anyhow::Result<Duration> {
    let mut bytes = [0; 4];
    openssl::rand::rand_bytes(&mut bytes)?;
    let millis = u64::from(u32::from_le_bytes(bytes)) % (max.as_millis() as u64 + 1);
    Ok(Duration::from_millis(millis))
}

/// A running bridge along with the credentials for everything that might connect to it.
pub struct Instance {
    pub bridge: bridge::Listener,
    pub creds: Creds,
    // Dropping TempDir cleans up the directory, but it needs to live to the end of the test.
    pub state_dir: tempfile::TempDir,
}

impl Instance {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Start a bridge on ephemeral loopback ports after applying `tweak` to its configuration.
    pub async fn with_config(tweak: impl FnOnce(&mut bridge::Config)) -> anyhow::Result<Self> {
        let state_dir = tempfile::TempDir::new()?;
        let creds = create_credentials(state_dir.path())?;

        let mut config = bridge::Config {
            server_listening_address: SocketAddr::from_str("127.0.0.1:0")?,
            client_listening_address: SocketAddr::from_str("127.0.0.1:0")?,
            credentials: creds.bridge.clone(),
            ..Default::default()
        };
        tweak(&mut config);
        let bridge = bridge::listen(config)
            .instrument(tracing::info_span!("bridge"))
            .await?;

        Ok(Self {
            bridge,
            creds,
            state_dir,
        })
    }

    pub async fn connect_server(&self) -> anyhow::Result<SslStream<TcpStream>> {
        connect(&self.creds.server, self.bridge.server_port()).await
    }

    pub async fn connect_client(&self) -> anyhow::Result<SslStream<TcpStream>> {
        connect(&self.creds.client, self.bridge.client_port()).await
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        self.bridge.halt().await
    }
}
