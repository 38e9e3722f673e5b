use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::wire::{DataCodec, HandshakeCodec, NoticeCodec, RequestCodec};

/// The three independently-framed streams a peer connection is made
/// of. Kept separate rather than multiplexed over one socket so a slow
/// consumer of, say, piece data never backs up notice delivery.
pub struct Connection {
    pub notices: Framed<TcpStream, NoticeCodec>,
    pub requests: Framed<TcpStream, RequestCodec>,
    pub data: Framed<TcpStream, DataCodec>,
}

impl Connection {
    /// Wraps three already-connected sockets, one per stream. Callers
    /// are expected to have exchanged a `FilterHandshake` over each
    /// socket via `HandshakeCodec` before constructing a `Connection`.
    pub fn new(notices: TcpStream, requests: TcpStream, data: TcpStream) -> Self {
        Self {
            notices: Framed::new(notices, NoticeCodec),
            requests: Framed::new(requests, RequestCodec),
            data: Framed::new(data, DataCodec),
        }
    }

    pub fn handshake_codec() -> HandshakeCodec {
        HandshakeCodec
    }
}
