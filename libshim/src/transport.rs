//! Stream transport: endpoint addressing, message framing, and the TCP/TLS
//! client connect.
//!
//! The core consumes the transport purely as "send an envelope" / "receive
//! an envelope"; this module is the only place that knows how envelopes are
//! framed. Each frame is a big-endian u32 length prefix followed by the
//! JSON-encoded [`ChaincodeMessage`], with an upper bound so a corrupt
//! length can never trigger an unbounded allocation.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::ShimError;
use crate::message::ChaincodeMessage;

/// Maximum frame length: 16 MiB.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A parsed peer endpoint.
///
/// Accepted forms are `grpc://host:port` (plaintext), `grpcs://host:port`
/// (TLS) and a bare `host:port` (plaintext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Peer hostname or address.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Whether the scheme requires TLS.
    pub tls: bool,
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// # Errors
    /// Returns [`ShimError::InvalidArgument`] for a missing host or an
    /// unparsable port.
    pub fn parse(addr: &str) -> Result<Self, ShimError> {
        let (rest, tls) = if let Some(rest) = addr.strip_prefix("grpcs://") {
            (rest, true)
        } else if let Some(rest) = addr.strip_prefix("grpc://") {
            (rest, false)
        } else {
            (addr, false)
        };

        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| ShimError::invalid_argument(format!("missing port in '{addr}'")))?;
        if host.is_empty() {
            return Err(ShimError::invalid_argument(format!(
                "missing host in '{addr}'"
            )));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| ShimError::invalid_argument(format!("invalid port in '{addr}'")))?;

        Ok(Self {
            host: host.to_owned(),
            port,
            tls,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "grpcs" } else { "grpc" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Marker trait for anything the connection can run over. Blanket-implemented
/// so tests can substitute in-memory duplex streams for real sockets.
pub trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

/// Open a stream to the peer, with TLS when the endpoint scheme requires it.
///
/// # Errors
/// Returns [`ShimError::Transport`] for connect failures, and
/// [`ShimError::InvalidArgument`] when a `grpcs://` endpoint is given
/// without a TLS configuration.
#[instrument(skip(tls_config))]
pub async fn connect(
    endpoint: &Endpoint,
    tls_config: Option<rustls::ClientConfig>,
) -> Result<Box<dyn PeerIo>, ShimError> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(ShimError::transport)?;
    debug!(%endpoint, "peer stream connected");

    if !endpoint.tls {
        return Ok(Box::new(tcp));
    }

    let tls_config = tls_config.ok_or_else(|| {
        ShimError::invalid_argument(format!("endpoint {endpoint} requires a TLS configuration"))
    })?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
        .map_err(|e| ShimError::invalid_argument(format!("invalid TLS server name: {e}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(ShimError::transport)?;
    debug!(%endpoint, "TLS handshake complete");
    Ok(Box::new(stream))
}

/// Reads length-prefixed envelopes from the inbound half of the stream.
pub struct MessageReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap the inbound half of a peer stream.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one envelope. A clean or abrupt EOF maps to
    /// [`ShimError::ConnectionLost`] so callers can distinguish "the link
    /// went away" from a malformed frame.
    ///
    /// A [`ShimError::Protocol`] from this method means the frame itself was
    /// intact and fully consumed but its body did not decode; the stream is
    /// still frame-aligned and the caller may keep reading. An out-of-bounds
    /// length loses alignment and is a [`ShimError::Transport`].
    pub async fn read_message(&mut self) -> Result<ChaincodeMessage, ShimError> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ShimError::connection_lost("peer stream closed"));
            }
            Err(e) => return Err(ShimError::transport(format!("read frame length: {e}"))),
        };
        if len > MAX_FRAME_LEN {
            return Err(ShimError::transport(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}"
            )));
        }

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ShimError::connection_lost("peer stream closed mid-frame")
            } else {
                ShimError::transport(format!("read frame body: {e}"))
            }
        })?;

        serde_json::from_slice(&body)
            .map_err(|e| ShimError::protocol(format!("malformed envelope: {e}")))
    }
}

/// Writes length-prefixed envelopes to the outbound half of the stream.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap the outbound half of a peer stream.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Access the underlying stream, bypassing the frame codec.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Write and flush one envelope.
    pub async fn write_message(&mut self, msg: &ChaincodeMessage) -> Result<(), ShimError> {
        let body = serde_json::to_vec(msg)
            .map_err(|e| ShimError::protocol(format!("encode envelope: {e}")))?;
        if body.len() > MAX_FRAME_LEN as usize {
            return Err(ShimError::protocol(format!(
                "frame length {} exceeds {MAX_FRAME_LEN}",
                body.len()
            )));
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = body.len() as u32;
        self.writer
            .write_u32(len)
            .await
            .map_err(|e| ShimError::transport(format!("write frame length: {e}")))?;
        self.writer
            .write_all(&body)
            .await
            .map_err(|e| ShimError::transport(format!("write frame body: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ShimError::transport(format!("flush frame: {e}")))
    }
}
