use futures_util::FutureExt;
use relay_core::{Event, Frame, FrameError, FrameStream};
use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        Self::Frame(FrameError::Io(err))
    }
}

/// Result of draining whatever a ready socket holds right now.
#[derive(Debug)]
pub enum ReadState {
    Frame(Frame),
    /// Part of a frame arrived; the rest stays buffered for a later call.
    Incomplete,
    Closed,
}

/// One client socket as seen by the dispatch loop.
pub struct Connection {
    conn_id: String,
    peer: SocketAddr,
    stream: FrameStream<TcpStream>,
}

impl Connection {
    pub fn new(conn_id: String, socket: TcpStream, peer: SocketAddr, max_frame_bytes: usize) -> Self {
        let _ = socket.set_nodelay(true);
        Self {
            conn_id,
            peer,
            stream: FrameStream::with_max_frame_bytes(socket, max_frame_bytes),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn has_buffered(&self) -> bool {
        self.stream.has_buffered()
    }

    /// Resolves once the socket has data, has reached end-of-stream or failed.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.get_ref().readable().await
    }

    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, ConnectionError> {
        match tokio::time::timeout(timeout, self.stream.read_frame()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    /// Pulls the bytes available right now without waiting on the socket.
    /// The frame reader keeps partial input across calls.
    pub fn try_read_frame(&mut self) -> Result<ReadState, ConnectionError> {
        match self.stream.read_frame().now_or_never() {
            Some(Ok(Some(frame))) => Ok(ReadState::Frame(frame)),
            Some(Ok(None)) => Ok(ReadState::Closed),
            Some(Err(err)) => Err(err.into()),
            None => Ok(ReadState::Incomplete),
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.stream.pending_bytes()
    }

    pub async fn write_frame(&mut self, raw: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        match tokio::time::timeout(timeout, self.stream.write_frame(raw)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    pub async fn write_event(&mut self, event: &Event, timeout: Duration) -> Result<(), ConnectionError> {
        match tokio::time::timeout(timeout, self.stream.write_event(event)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    #[cfg(test)]
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Shuts the write side down; the socket itself closes on drop.
    pub async fn close(mut self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.stream.shutdown()).await;
    }
}
