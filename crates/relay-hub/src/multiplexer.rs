use crate::connection::Connection;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::{collections::HashSet, io, net::SocketAddr, time::Duration};
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Owns the listening socket and waits on readiness of session sockets.
pub struct Multiplexer {
    listener: TcpListener,
}

impl Multiplexer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits up to `timeout` for one incoming connection.
    pub async fn accept(&self, timeout: Duration) -> Option<(TcpStream, SocketAddr)> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok(accepted)) => Some(accepted),
            Ok(Err(err)) => {
                warn!(event = "relay_accept_error", error = %err);
                None
            }
            Err(_) => None,
        }
    }

    /// Returns the keys whose connection can be read without blocking:
    /// buffered bytes, fresh data, end-of-stream or a socket error.
    ///
    /// Waits at most `timeout` for the first one, then collects any others
    /// that are ready at that moment. No ordering is implied.
    pub async fn wait_readable<'a, I>(connections: I, timeout: Duration) -> HashSet<String>
    where
        I: IntoIterator<Item = (&'a String, &'a Connection)>,
    {
        let mut ready = HashSet::new();
        let mut waits = FuturesUnordered::new();
        for (key, connection) in connections {
            if connection.has_buffered() {
                ready.insert(key.clone());
            } else {
                waits.push(async move {
                    let _ = connection.readable().await;
                    key
                });
            }
        }
        if waits.is_empty() {
            return ready;
        }

        if ready.is_empty() {
            match tokio::time::timeout(timeout, waits.next()).await {
                Ok(Some(key)) => {
                    ready.insert(key.clone());
                }
                Ok(None) | Err(_) => return ready,
            }
        }

        while let Some(Some(key)) = waits.next().now_or_never() {
            ready.insert(key.clone());
        }
        ready
    }
}
