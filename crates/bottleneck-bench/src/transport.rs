//! # QUIC transport
//!
//! `quinn` on `rustls` with the ring provider, TLS 1.3 only, ALPN
//! `throughput-test`. The sender side exposes a single unidirectional
//! stream as a [`FlowStream`]; the receiver side accepts connections and
//! streams indefinitely and throws the data away.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::sync::watch;

use crate::error::{ConfigError, FlowError};
use crate::pacer::FlowStream;

pub const ALPN: &[u8] = b"throughput-test";

/// Name the receiver certificate is issued for and the sender asks for.
pub const SERVER_NAME: &str = "localhost";

/// How long a finished sender waits for the peer to read everything.
pub const LINGER: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 64 * 1024;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ─── Sender side ────────────────────────────────────────────────────────────

/// How the sender checks the receiver's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Accept any certificate. Receivers use throwaway self-signed ones.
    Insecure,
    /// Trust exactly the certificate(s) in this PEM file.
    Pinned(PathBuf),
}

impl Verification {
    /// Pins `ca` when given; skipping verification must be asked for.
    pub fn from_flags(no_verify: bool, ca: Option<PathBuf>) -> Result<Self, ConfigError> {
        match (ca, no_verify) {
            (Some(pem), _) => Ok(Verification::Pinned(pem)),
            (None, true) => Ok(Verification::Insecure),
            (None, false) => Err(ConfigError::NoTrustAnchor),
        }
    }
}

pub fn client_config(verification: &Verification) -> Result<quinn::ClientConfig, FlowError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| FlowError::Tls(e.to_string()))?;

    let mut crypto = match verification {
        Verification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth(),
        Verification::Pinned(path) => {
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_file_iter(path)
                .map_err(|e| FlowError::Tls(format!("{}: {e}", path.display())))?
            {
                let cert = cert.map_err(|e| FlowError::Tls(format!("{}: {e}", path.display())))?;
                roots
                    .add(cert)
                    .map_err(|e| FlowError::Tls(e.to_string()))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic = QuicClientConfig::try_from(crypto).map_err(|e| FlowError::Tls(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic)))
}

/// One open connection with one unidirectional stream on it.
pub struct QuicFlow {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    stream: quinn::SendStream,
}

/// Connects to `addr` and opens the flow's stream.
pub async fn connect(addr: SocketAddr, verification: &Verification) -> Result<QuicFlow, FlowError> {
    let config = client_config(verification)?;
    let bind: SocketAddr = if addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind)?;
    endpoint.set_default_client_config(config);

    let connection = endpoint
        .connect(addr, SERVER_NAME)
        .map_err(|e| FlowError::Connect(e.to_string()))?
        .await
        .map_err(|e| FlowError::Connect(e.to_string()))?;
    let stream = connection
        .open_uni()
        .await
        .map_err(|e| FlowError::Connect(e.to_string()))?;

    tracing::debug!(remote = %addr, "connected");
    Ok(QuicFlow {
        endpoint,
        connection,
        stream,
    })
}

impl QuicFlow {
    /// Closes the connection and waits briefly for the close to be sent.
    pub async fn close(self) {
        self.connection.close(0u32.into(), b"done");
        let _ = tokio::time::timeout(LINGER, self.endpoint.wait_idle()).await;
    }
}

impl FlowStream for QuicFlow {
    async fn send_chunk(&mut self, chunk: &Bytes) -> Result<(), FlowError> {
        self.stream
            .write_chunk(chunk.clone())
            .await
            .map_err(|e| FlowError::Stream(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), FlowError> {
        self.stream
            .finish()
            .map_err(|e| FlowError::Stream(e.to_string()))?;
        // the peer may already be gone; closing is still a success
        let _ = tokio::time::timeout(LINGER, self.stream.stopped()).await;
        Ok(())
    }

    fn smoothed_rtt_ms(&self) -> Option<f64> {
        let rtt = self.connection.rtt();
        (!rtt.is_zero()).then(|| rtt.as_secs_f64() * 1e3)
    }

    fn congestion_window(&self) -> Option<u64> {
        Some(self.connection.stats().path.cwnd)
    }
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ─── Receiver side ──────────────────────────────────────────────────────────

/// Where the receiver's certificate comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerIdentity {
    /// Self-signed for [`SERVER_NAME`], generated at startup.
    Generated,
    Files { cert: PathBuf, key: PathBuf },
}

fn load_identity(
    identity: &ServerIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), FlowError> {
    match identity {
        ServerIdentity::Generated => {
            let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
                .map_err(|e| FlowError::Tls(e.to_string()))?;
            let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
            Ok((vec![certified.cert.der().clone()], key.into()))
        }
        ServerIdentity::Files { cert, key } => {
            let certs = CertificateDer::pem_file_iter(cert)
                .map_err(|e| FlowError::Tls(format!("{}: {e}", cert.display())))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| FlowError::Tls(format!("{}: {e}", cert.display())))?;
            let key = PrivateKeyDer::from_pem_file(key)
                .map_err(|e| FlowError::Tls(format!("{}: {e}", key.display())))?;
            Ok((certs, key))
        }
    }
}

pub fn server_config(identity: &ServerIdentity) -> Result<quinn::ServerConfig, FlowError> {
    let (certs, key) = load_identity(identity)?;
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| FlowError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FlowError::Tls(e.to_string()))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic = QuicServerConfig::try_from(crypto).map_err(|e| FlowError::Tls(e.to_string()))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic)))
}

/// Throughput sink: accepts every connection and drains every stream.
pub struct PassiveReceiver {
    endpoint: quinn::Endpoint,
}

impl PassiveReceiver {
    pub fn bind(addr: SocketAddr, identity: &ServerIdentity) -> Result<Self, FlowError> {
        let config = server_config(identity)?;
        let endpoint = quinn::Endpoint::server(config, addr)?;
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, FlowError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Serves until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(addr = ?self.endpoint.local_addr().ok(), "receiver listening");
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(incoming).await {
                            tracing::debug!(error = %e, "connection ended");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        tracing::info!("receiver stopped");
    }
}

async fn handle_connection(incoming: quinn::Incoming) -> Result<(), quinn::ConnectionError> {
    let connection = incoming.await?;
    let remote = connection.remote_address();
    tracing::debug!(%remote, "connection accepted");

    loop {
        let mut recv = match connection.accept_uni().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                tracing::debug!(%remote, "connection closed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        tokio::spawn(async move {
            let mut total = 0u64;
            loop {
                match recv.read_chunk(READ_CHUNK, false).await {
                    Ok(Some(chunk)) => total += chunk.bytes.len() as u64,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(%remote, error = %e, "stream aborted");
                        break;
                    }
                }
            }
            tracing::debug!(%remote, bytes = total, "stream drained");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::{send_flow, PacingParams};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn start(identity: &ServerIdentity) -> (SocketAddr, watch::Sender<bool>) {
        let receiver = PassiveReceiver::bind(loopback(), identity).unwrap();
        let addr = receiver.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(receiver.run(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn paced_flow_over_loopback() {
        let (addr, stop) = start(&ServerIdentity::Generated).await;
        let dir = tempfile::tempdir().unwrap();
        let metrics = dir.path().join("raw.json");

        let mut flow = connect(addr, &Verification::Insecure).await.unwrap();
        let params = PacingParams {
            duration: Duration::from_millis(2500),
            target_rate_mbps: 2.0,
            chunk_size: 16 * 1024,
        };
        let stats = send_flow(&mut flow, &params, Some(&metrics)).await.unwrap();
        flow.close().await;
        let _ = stop.send(true);

        assert!(stats.bytes_sent > 0);
        assert!(stats.throughput_mbps > 0.5 && stats.throughput_mbps < 4.0);

        let out = crate::metrics_log::read_samples(&metrics).unwrap();
        assert_eq!(out.samples.len(), 2);
        assert!(out.samples.iter().all(|s| s.rtt_ms > 0.0));
        assert!(out.samples.iter().all(|s| s.cwnd_bytes.unwrap_or(0) > 0));
    }

    #[tokio::test]
    async fn back_to_back_short_connections() {
        let (addr, stop) = start(&ServerIdentity::Generated).await;
        for _ in 0..5 {
            let mut flow = connect(addr, &Verification::Insecure).await.unwrap();
            flow.send_chunk(&Bytes::from_static(b"ping")).await.unwrap();
            flow.finish().await.unwrap();
            flow.close().await;
        }
        // still serving after the burst
        let flow = connect(addr, &Verification::Insecure).await.unwrap();
        flow.close().await;
        let _ = stop.send(true);
    }

    #[tokio::test]
    async fn pinned_certificate_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let write_identity = |name: &str| {
            let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).unwrap();
            let cert = dir.path().join(format!("{name}.pem"));
            let key = dir.path().join(format!("{name}.key"));
            std::fs::write(&cert, certified.cert.pem()).unwrap();
            std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
            (cert, key)
        };
        let (cert, key) = write_identity("server");
        let (other, _) = write_identity("other");

        let (addr, stop) = start(&ServerIdentity::Files { cert: cert.clone(), key }).await;

        let ok = connect(addr, &Verification::Pinned(cert)).await;
        assert!(ok.is_ok());
        ok.unwrap().close().await;

        let rejected = connect(addr, &Verification::Pinned(other)).await;
        assert!(matches!(rejected, Err(FlowError::Connect(_))));
        let _ = stop.send(true);
    }

    #[test]
    fn verification_must_be_chosen_explicitly() {
        assert!(matches!(
            Verification::from_flags(false, None),
            Err(ConfigError::NoTrustAnchor)
        ));
        assert_eq!(Verification::from_flags(true, None).unwrap(), Verification::Insecure);
        assert_eq!(
            Verification::from_flags(false, Some("ca.pem".into())).unwrap(),
            Verification::Pinned("ca.pem".into())
        );
    }

    #[tokio::test]
    async fn generated_certificate_is_rejected_unless_verification_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let unrelated = dir.path().join("unrelated.pem");
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).unwrap();
        std::fs::write(&unrelated, certified.cert.pem()).unwrap();

        let (addr, stop) = start(&ServerIdentity::Generated).await;

        let pinned = Verification::from_flags(false, Some(unrelated)).unwrap();
        assert!(matches!(connect(addr, &pinned).await, Err(FlowError::Connect(_))));

        let skipped = Verification::from_flags(true, None).unwrap();
        connect(addr, &skipped).await.unwrap().close().await;
        let _ = stop.send(true);
    }

    #[test]
    fn missing_identity_files_are_tls_errors() {
        let identity = ServerIdentity::Files {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(server_config(&identity), Err(FlowError::Tls(_))));
    }
}
