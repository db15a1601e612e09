use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::NetError;

/// A TCP stream carrying [`crate::Frame`]s, with Nagle disabled.
pub struct TokioTransport {
    stream: TcpStream,
}

impl TokioTransport {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, NetError> {
        Self::accepted(TcpStream::connect(addr).await?)
    }

    /// Wraps a stream handed out by a listener.
    pub fn accepted(stream: TcpStream) -> Result<Self, NetError> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Splits into halves so reads and writes can proceed concurrently.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
