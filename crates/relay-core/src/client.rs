//! Consumer-side relay client.
//!
//! Used by application back-ends to publish events and by front-end bridges
//! to consume subscriptions. Every call is bounded by the caller's timeout.

use crate::event::{is_valid_event_name, ControlEvent, Event};
use crate::frame::{FrameError, FrameStream};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("relay did not answer within {0:?}")]
    Timeout(Duration),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("relay closed the connection")]
    ConnectionClosed,
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),
}

pub struct RelayClient {
    stream: FrameStream<TcpStream>,
    ticket: String,
    identity: String,
}

impl RelayClient {
    /// Opens a connection and performs the login handshake. The whole
    /// exchange, including the TCP connect, is bounded by `timeout`.
    pub async fn connect(
        server: &str,
        port: u16,
        username: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let handshake = async {
            let socket = TcpStream::connect((server, port)).await?;
            socket.set_nodelay(true)?;
            let mut stream = FrameStream::new(socket);
            stream.write_event(&Event::login(username, credential)).await?;
            let reply = stream.read_frame().await?;
            Ok::<_, ClientError>((stream, reply))
        };
        let (stream, reply) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        let Some(reply) = reply else {
            return Err(ClientError::ConnectionClosed);
        };
        if reply.control != ControlEvent::Success {
            return Err(ClientError::LoginRejected(reply.event.payload_text()));
        }

        let ticket = reply.event.payload_text();
        debug!(
            event = "relay_client_connected",
            server = server,
            port = port,
            identity = username
        );
        Ok(Self {
            stream,
            ticket,
            identity: username.to_string(),
        })
    }

    pub fn ticket(&self) -> &str {
        &self.ticket
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Sends `event` and waits up to `timeout` for exactly one reply frame.
    /// `None` when the relay closed the stream or nothing arrived in time.
    pub async fn dispatch(
        &mut self,
        event: &Event,
        timeout: Duration,
    ) -> Result<Option<Event>, ClientError> {
        self.send(event, timeout).await?;
        self.listen(timeout).await
    }

    /// Waits up to `timeout` for one unsolicited frame.
    pub async fn listen(&mut self, timeout: Duration) -> Result<Option<Event>, ClientError> {
        match tokio::time::timeout(timeout, self.stream.read_frame()).await {
            Ok(Ok(frame)) => Ok(frame.map(|frame| frame.event)),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Ok(None),
        }
    }

    /// Waits for the next frame with no deadline. `None` once the relay has
    /// closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<Event>, ClientError> {
        let frame = self.stream.read_frame().await?;
        Ok(frame.map(|frame| frame.event))
    }

    pub async fn send(&mut self, event: &Event, timeout: Duration) -> Result<(), ClientError> {
        tokio::time::timeout(timeout, self.stream.write_event(event))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        Ok(())
    }

    /// Publishes an application event attributed to this session.
    pub async fn publish(
        &mut self,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let event = Event::new(name, self.ticket.as_str(), payload);
        self.send(&event, timeout).await
    }

    pub async fn add_event_listener(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        ensure_event_name(name)?;
        let event = Event::add_event_listener(&self.ticket, name);
        self.send(&event, timeout).await
    }

    pub async fn remove_event_listener(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        ensure_event_name(name)?;
        let event = Event::remove_event_listener(&self.ticket, name);
        self.send(&event, timeout).await
    }

    /// Sends `Logout` and closes the socket.
    pub async fn disconnect(mut self, timeout: Duration) -> Result<(), ClientError> {
        let logout = Event::logout(&self.ticket);
        self.send(&logout, timeout).await?;
        let _ = tokio::time::timeout(timeout, self.stream.shutdown()).await;
        debug!(event = "relay_client_disconnected", identity = %self.identity);
        Ok(())
    }
}

fn ensure_event_name(name: &str) -> Result<(), ClientError> {
    if is_valid_event_name(name) {
        Ok(())
    } else {
        Err(ClientError::InvalidEventName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(3);

    async fn fake_relay() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        (listener, port)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_returns_ticket_on_success() {
        let (listener, port) = fake_relay().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut stream = FrameStream::new(socket);
            let login = stream.read_frame().await.expect("read").expect("login");
            assert_eq!(login.control, ControlEvent::Login);
            assert_eq!(login.event.sender(), "alice");
            assert_eq!(login.event.payload_text(), "secret");
            stream
                .write_event(&Event::success("ticket-a"))
                .await
                .expect("reply");
            stream.read_frame().await.expect("read")
        });

        let client = RelayClient::connect("127.0.0.1", port, "alice", "secret", TIMEOUT)
            .await
            .expect("connect");
        assert_eq!(client.ticket(), "ticket-a");
        assert_eq!(client.identity(), "alice");

        client.disconnect(TIMEOUT).await.expect("disconnect");
        let logout = server.await.expect("join").expect("logout frame");
        assert_eq!(logout.control, ControlEvent::Logout);
        assert_eq!(logout.event.sender(), "ticket-a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_reports_rejection_reason() {
        let (listener, port) = fake_relay().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut stream = FrameStream::new(socket);
            let _ = stream.read_frame().await;
            let _ = stream
                .write_event(&Event::new("Login", "relay", json!("invalid credentials")))
                .await;
        });

        let result = RelayClient::connect("127.0.0.1", port, "alice", "wrong", TIMEOUT).await;
        match result {
            Err(ClientError::LoginRejected(reason)) => assert_eq!(reason, "invalid credentials"),
            other => panic!("expected rejection, got {:?}", other.map(|c| c.ticket)),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_times_out_without_reply() {
        let (listener, port) = fake_relay().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });

        let result = RelayClient::connect(
            "127.0.0.1",
            port,
            "alice",
            "secret",
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        let _ = server.await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_waits_for_one_reply_and_listen_times_out() {
        let (listener, port) = fake_relay().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut stream = FrameStream::new(socket);
            let _ = stream.read_frame().await;
            let _ = stream.write_event(&Event::success("ticket-a")).await;
            while let Ok(Some(frame)) = stream.read_frame().await {
                if frame.event.name() == "Archive.Ping" {
                    let reply = Event::new("Archive.Pong", "relay", frame.event.payload().clone());
                    let _ = stream.write_event(&reply).await;
                }
            }
        });

        let mut client = RelayClient::connect("127.0.0.1", port, "alice", "secret", TIMEOUT)
            .await
            .expect("connect");
        let ping = Event::new("Archive.Ping", client.ticket(), json!({"n": 1}));
        let reply = client
            .dispatch(&ping, TIMEOUT)
            .await
            .expect("dispatch")
            .expect("reply");
        assert_eq!(reply.name(), "Archive.Pong");
        assert_eq!(reply.payload(), &json!({"n": 1}));

        let idle = client
            .listen(Duration::from_millis(100))
            .await
            .expect("listen");
        assert!(idle.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listener_requests_validate_event_names() {
        let (listener, port) = fake_relay().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut stream = FrameStream::new(socket);
            let _ = stream.read_frame().await;
            let _ = stream.write_event(&Event::success("ticket-a")).await;
            while let Ok(Some(_)) = stream.read_frame().await {}
        });

        let mut client = RelayClient::connect("127.0.0.1", port, "alice", "secret", TIMEOUT)
            .await
            .expect("connect");
        let result = client.add_event_listener("Doc Changed", TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::InvalidEventName(_))));
        client
            .add_event_listener("Doc.Changed", TIMEOUT)
            .await
            .expect("subscribe");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn next_event_distinguishes_eof() {
        let (listener, port) = fake_relay().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let mut stream = FrameStream::new(socket);
            let _ = stream.read_frame().await;
            let _ = stream.write_event(&Event::success("ticket-a")).await;
            let _ = stream.write_event(&Event::shutdown("relay", "bye")).await;
            let _ = stream.shutdown().await;
        });

        let mut client = RelayClient::connect("127.0.0.1", port, "alice", "secret", TIMEOUT)
            .await
            .expect("connect");
        let notice = client.next_event().await.expect("read").expect("notice");
        assert_eq!(notice.control(), ControlEvent::Shutdown);
        assert!(client.next_event().await.expect("read").is_none());
    }
}
