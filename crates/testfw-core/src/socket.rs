//! Line-buffered IRC socket over TCP or TLS.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{FrameworkError, FrameworkResult};
use crate::ircmsg::Message;

/// Any duplex byte stream a socket can run over.
pub trait LineStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineStream for T {}

/// A connected client socket that reads and writes whole IRC lines.
pub struct Socket {
    stream: BufStream<Box<dyn LineStream>>,
    connected: bool,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Connect to `address` (`host:port`), optionally over TLS.
    pub async fn connect(
        address: &str,
        use_tls: bool,
        tls_skip_verify: bool,
    ) -> FrameworkResult<Self> {
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| FrameworkError::Connection(format!("{}: {}", address, e)))?;
        // lines are tiny and latency matters for the sync pings
        let _ = tcp.set_nodelay(true);

        if !use_tls {
            tracing::debug!(address = %address, "Connected");
            return Ok(Self::from_stream(tcp));
        }

        let connector = TlsConnector::from(Arc::new(tls_config(tls_skip_verify)));
        let server_name = ServerName::try_from(host_part(address).to_string())
            .map_err(|e| FrameworkError::Tls(format!("{}: {}", address, e)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| FrameworkError::Tls(format!("{}: handshake failed: {}", address, e)))?;

        tracing::debug!(address = %address, verify = !tls_skip_verify, "Connected with TLS");
        Ok(Self::from_stream(tls))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream<S: LineStream + 'static>(stream: S) -> Self {
        Self {
            stream: BufStream::new(Box::new(stream)),
            connected: true,
        }
    }

    /// Read one line, without its terminator. Bytes that are not valid
    /// UTF-8 are replaced rather than rejected.
    pub async fn read_line(&mut self) -> FrameworkResult<String> {
        if !self.connected {
            return Err(FrameworkError::Disconnected);
        }

        let mut buf = Vec::new();
        let read = self.stream.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            self.connected = false;
            return Err(FrameworkError::Disconnected);
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Write one line, normalising the terminator to `\r\n`.
    pub async fn write_line(&mut self, line: &str) -> FrameworkResult<()> {
        if !self.connected {
            return Err(FrameworkError::Disconnected);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Serialise and send a message.
    pub async fn send(&mut self, msg: &Message) -> FrameworkResult<()> {
        let line = msg.to_line()?;
        self.write_line(&line).await
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.stream.shutdown().await;
        }
    }

    /// Send `QUIT`, then close. Errors are ignored since the peer may
    /// already be gone.
    pub async fn quit(&mut self) {
        let _ = self.write_line("QUIT").await;
        self.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

fn host_part(address: &str) -> &str {
    // [::1]:6697
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match address.rsplit_once(':') {
        Some((host, _)) => host,
        None => address,
    }
}

fn tls_config(skip_verify: bool) -> ClientConfig {
    let builder = ClientConfig::builder();

    if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    }
}

/// Accepts any server certificate, for test servers with self-signed certs.
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
