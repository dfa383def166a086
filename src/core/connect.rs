/// Backend dialing and the SSL negotiation handshake.
///
/// A connection starts life as a plain TCP stream and may be swapped for an
/// encrypted one during negotiation, so everything downstream handles the
/// boxed `ProxyStream` type rather than `TcpStream` directly.
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::SslConfig;
use crate::core::tls::StreamUpgrader;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol;

/// Object-safe transport bound satisfied by plain and upgraded streams.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A client or backend transport, possibly upgraded.
pub type ProxyStream = Box<dyn Stream>;

/// Read chunk size. Matches the largest frame the relay reads in one pass;
/// larger responses arrive as multiple drain reads.
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Write a complete message to the stream, checking both the write and the
/// flush.
pub async fn send(stream: &mut ProxyStream, message: &[u8]) -> ProxyResult<()> {
    stream.write_all(message).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one chunk from the stream. The chunk may hold a partial frame or a
/// batch of frames; callers scan boundaries with the protocol helpers. A
/// zero-length read maps to an end-of-stream error that `is_disconnect`
/// recognizes.
pub async fn receive(stream: &mut ProxyStream) -> ProxyResult<BytesMut> {
    let mut buffer = BytesMut::zeroed(RECEIVE_BUFFER_SIZE);
    let length = stream.read(&mut buffer).await?;
    if length == 0 {
        return Err(ProxyError::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }
    buffer.truncate(length);
    Ok(buffer)
}

/// Open a connection to a backend node, negotiating the encrypted transport
/// when enabled.
///
/// With SSL disabled the plain connection is returned without a single
/// protocol byte being sent. With SSL enabled the 8-byte request probe is
/// sent and the single response byte decides the outcome: acceptance runs
/// the upgrade, refusal closes the connection and fails the caller, and any
/// other byte is a distinct hard error.
pub async fn connect(
    host_port: &str,
    ssl: &SslConfig,
    upgrader: &dyn StreamUpgrader,
) -> ProxyResult<ProxyStream> {
    let tcp = TcpStream::connect(host_port).await?;
    tcp.set_nodelay(true)?;
    let mut stream: ProxyStream = Box::new(tcp);

    if !ssl.enable {
        return Ok(stream);
    }

    let request = protocol::create_ssl_request();
    send(&mut stream, &request).await?;

    let mut response = [0u8; 1];
    stream.read_exact(&mut response).await?;

    match response[0] {
        protocol::SSL_ALLOWED => {
            debug!(backend = host_port, "backend accepted SSL request, upgrading");
            let host = host_port.split(':').next().unwrap_or(host_port);
            upgrader.upgrade_backend(stream, host).await
        }
        protocol::SSL_NOT_ALLOWED => {
            // dropping the stream closes the refused connection
            Err(ProxyError::SslRefused)
        }
        other => Err(ProxyError::UnexpectedSslResponse(other)),
    }
}

/// Answer a client's SSL request frame: one acceptance or refusal byte,
/// followed by the server half of the upgrade when accepted. The caller
/// re-reads the client's real startup frame afterwards; a client that hangs
/// up on the answer is a normal outcome there, not an error.
pub async fn answer_ssl_probe(
    mut client: ProxyStream,
    ssl: &SslConfig,
    upgrader: &dyn StreamUpgrader,
) -> ProxyResult<ProxyStream> {
    let response = if ssl.enable {
        protocol::SSL_ALLOWED
    } else {
        protocol::SSL_NOT_ALLOWED
    };
    send(&mut client, &[response]).await?;

    if ssl.enable {
        client = upgrader.upgrade_client(client).await?;
    }

    Ok(client)
}
