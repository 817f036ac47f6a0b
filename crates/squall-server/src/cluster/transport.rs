//! Peer transport: length-prefixed MsgPack frames over TCP.
//!
//! Each frame is one [`PeerMessage`]. `LengthDelimitedCodec` handles the
//! 4-byte big-endian prefix; this module adds the encode/decode layer and a
//! handshake-friendly request/response helper.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use squall_core::protocol::{self, PeerMessage};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A framed peer connection.
pub type PeerFramed = Framed<TcpStream, LengthDelimitedCodec>;

/// Transport failures on a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer wire: {0}")]
    Wire(#[from] protocol::WireError),
    #[error("peer closed the connection")]
    Closed,
}

/// Wraps a fresh TCP stream in the peer framing.
#[must_use]
pub fn frame(stream: TcpStream) -> PeerFramed {
    let mut codec = LengthDelimitedCodec::new();
    // Replicated batches can be large; merkle diffs larger. 64 MiB is a
    // safety bound, not a target.
    codec.set_max_frame_length(64 * 1024 * 1024);
    Framed::new(stream, codec)
}

/// Sends one message.
///
/// # Errors
///
/// Returns [`TransportError`] on serialization or socket failure.
pub async fn send(framed: &mut PeerFramed, message: &PeerMessage) -> Result<(), TransportError> {
    let bytes = protocol::encode(message)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Receives the next message.
///
/// # Errors
///
/// Returns [`TransportError::Closed`] on clean EOF and [`TransportError`]
/// variants for socket or decode failures.
pub async fn recv(framed: &mut PeerFramed) -> Result<PeerMessage, TransportError> {
    match framed.next().await {
        Some(Ok(frame)) => Ok(protocol::decode(&frame)?),
        Some(Err(err)) => Err(TransportError::Io(err)),
        None => Err(TransportError::Closed),
    }
}
