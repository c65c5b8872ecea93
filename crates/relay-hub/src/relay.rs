//! The relay dispatch loop.
//!
//! A single task owns the listener, every session socket and both
//! registries. Each iteration accepts at most one login, reads one frame from
//! every ready session, routes application events to subscribers and then
//! reclaims sessions that failed along the way.

use crate::auth::Authenticator;
use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionError, ReadState};
use crate::multiplexer::Multiplexer;
use crate::registry::Registry;
use relay_core::{is_valid_event_name, ControlEvent, Event, Frame, FrameError};
use serde_json::Value;
use std::{io, net::SocketAddr};
use tokio::{net::TcpStream, sync::watch};
use tracing::{debug, info, warn};

const SHUTDOWN_REASON: &str = "relay shutting down";

pub struct Relay {
    config: RelayConfig,
    multiplexer: Multiplexer,
    registry: Registry<Connection>,
    authenticator: Box<dyn Authenticator>,
    conn_counter: u64,
}

/// Sessions scheduled for removal during one iteration. A ticket in here is
/// never read from or written to again.
#[derive(Default)]
struct Reaper {
    pending: Vec<(String, &'static str)>,
}

impl Reaper {
    fn schedule(&mut self, ticket: &str, reason: &'static str) {
        if !self.contains(ticket) {
            self.pending.push((ticket.to_string(), reason));
        }
    }

    fn contains(&self, ticket: &str) -> bool {
        self.pending.iter().any(|(pending, _)| pending == ticket)
    }
}

impl Relay {
    pub async fn bind(
        config: RelayConfig,
        authenticator: Box<dyn Authenticator>,
    ) -> io::Result<Self> {
        let multiplexer = Multiplexer::bind(&config.addr()).await?;
        Ok(Self {
            config,
            multiplexer,
            registry: Registry::new(),
            authenticator,
            conn_counter: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.multiplexer.local_addr()
    }

    /// Runs until `shutdown` turns true or its sender is dropped, then
    /// notifies and closes every session.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let addr = self.local_addr()?;
        info!(event = "relay_start", server_id = %self.config.server_id, addr = %addr);

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.accept_once().await;
            self.dispatch_ready().await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.idle_interval) => {}
            }
        }

        self.shutdown(SHUTDOWN_REASON).await;
        info!(event = "relay_stop", server_id = %self.config.server_id);
        Ok(())
    }

    fn next_conn_id(&mut self) -> String {
        self.conn_counter += 1;
        format!("relay-conn-{}", self.conn_counter)
    }

    async fn accept_once(&mut self) {
        if let Some((socket, peer)) = self.multiplexer.accept(self.config.accept_timeout).await {
            self.handshake(socket, peer).await;
        }
    }

    /// Reads exactly one frame from a fresh connection; only `Login` is
    /// accepted. Bounded by the handshake timeout.
    async fn handshake(&mut self, socket: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn_id();
        let mut connection =
            Connection::new(conn_id.clone(), socket, peer, self.config.max_frame_bytes);
        debug!(event = "relay_connection_accepted", conn_id = %conn_id, peer = %peer);

        let frame = match connection.read_frame(self.config.handshake_timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(event = "relay_handshake_eof", conn_id = %conn_id);
                return;
            }
            Err(err) => {
                warn!(event = "relay_handshake_failed", conn_id = %conn_id, error = %err);
                connection.close(self.config.write_timeout).await;
                return;
            }
        };

        if frame.control != ControlEvent::Login {
            warn!(
                event = "relay_handshake_violation",
                conn_id = %conn_id,
                name = %frame.control,
            );
            connection.close(self.config.write_timeout).await;
            return;
        }

        let username = frame.event.sender().to_string();
        let credential = frame.event.payload_text();
        let ticket = match self.authenticator.login(&username, &credential) {
            Ok(ticket) => ticket,
            Err(err) => {
                info!(event = "relay_login_rejected", conn_id = %conn_id, identity = %username);
                let reply = Event::new(
                    frame.event.name(),
                    self.config.server_id.as_str(),
                    Value::String(err.to_string()),
                );
                if let Err(err) = connection.write_event(&reply, self.config.write_timeout).await {
                    debug!(event = "relay_reject_write_failed", conn_id = %conn_id, error = %err);
                }
                connection.close(self.config.write_timeout).await;
                return;
            }
        };

        if let Err(err) = self.registry.register(&ticket, &username, connection) {
            // The registry dropped the connection, which closes it.
            warn!(event = "relay_register_failed", conn_id = %conn_id, error = %err);
            return;
        }

        let success = Event::success(&ticket);
        let sent = match self.registry.get_mut(&ticket) {
            Some(session) => session
                .connection
                .write_event(&success, self.config.write_timeout)
                .await
                .is_ok(),
            None => false,
        };
        if !sent {
            self.drop_session(&ticket, "login_reply_failed").await;
            return;
        }
        info!(
            event = "relay_session_opened",
            conn_id = %conn_id,
            identity = %username,
            peer = %peer,
            sessions = self.registry.len(),
        );
    }

    async fn dispatch_ready(&mut self) {
        let ready =
            Multiplexer::wait_readable(self.registry.connections(), self.config.wait_timeout).await;
        let mut reaper = Reaper::default();

        for ticket in ready {
            if reaper.contains(&ticket) {
                continue;
            }
            let Some(session) = self.registry.get_mut(&ticket) else {
                continue;
            };
            let conn_id = session.connection.conn_id().to_string();
            match session.connection.try_read_frame() {
                Ok(ReadState::Frame(frame)) => self.handle_frame(&ticket, frame, &mut reaper).await,
                Ok(ReadState::Incomplete) => {
                    debug!(
                        event = "relay_frame_incomplete",
                        conn_id = %conn_id,
                        pending = session.connection.pending_bytes(),
                    );
                }
                Ok(ReadState::Closed) => reaper.schedule(&ticket, "eof"),
                Err(err) => {
                    warn!(event = "relay_read_failed", conn_id = %conn_id, error = %err);
                    reaper.schedule(&ticket, read_failure_reason(&err));
                }
            }
        }

        for (ticket, reason) in reaper.pending {
            self.drop_session(&ticket, reason).await;
        }
    }

    async fn handle_frame(&mut self, ticket: &str, frame: Frame, reaper: &mut Reaper) {
        match frame.control {
            ControlEvent::Logout => {
                self.authenticator.logout(ticket);
                reaper.schedule(ticket, "logout");
            }
            ControlEvent::Subscribe => {
                let Some(name) = listener_name(&frame.event) else {
                    warn!(event = "relay_invalid_listener", payload = %frame.event.payload());
                    return;
                };
                match self.registry.subscribe(ticket, name) {
                    Ok(()) => debug!(event = "relay_subscribed", name = name),
                    Err(err) => warn!(event = "relay_subscribe_failed", name = name, error = %err),
                }
            }
            ControlEvent::Unsubscribe => {
                let Some(name) = listener_name(&frame.event) else {
                    warn!(event = "relay_invalid_listener", payload = %frame.event.payload());
                    return;
                };
                self.registry.unsubscribe(ticket, name);
                debug!(event = "relay_unsubscribed", name = name);
            }
            ControlEvent::Application(name) => {
                self.route(&name, &frame.raw, reaper).await;
            }
            ControlEvent::Login | ControlEvent::Success | ControlEvent::Shutdown => {
                warn!(event = "relay_control_misuse", name = %frame.control);
            }
        }
    }

    /// Writes the verbatim frame to every subscriber of `name`.
    async fn route(&mut self, name: &str, raw: &[u8], reaper: &mut Reaper) {
        let targets = self.registry.subscribers_of(name);
        let mut delivered = 0usize;
        for target in targets {
            if reaper.contains(&target) {
                continue;
            }
            let Some(session) = self.registry.get_mut(&target) else {
                continue;
            };
            match session
                .connection
                .write_frame(raw, self.config.write_timeout)
                .await
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        event = "relay_send_error",
                        conn_id = %session.connection.conn_id(),
                        error = %err,
                    );
                    reaper.schedule(&target, "send_error");
                }
            }
        }
        debug!(event = "relay_routed", name = name, delivered);
    }

    async fn drop_session(&mut self, ticket: &str, reason: &str) {
        let subscriptions = self.registry.subscriptions_of(ticket).len();
        let Some(session) = self.registry.unregister(ticket) else {
            return;
        };
        let conn_id = session.connection.conn_id().to_string();
        let peer = session.connection.peer();
        session.connection.close(self.config.write_timeout).await;
        info!(
            event = "relay_session_closed",
            conn_id = %conn_id,
            peer = %peer,
            identity = %session.identity,
            reason = reason,
            subscriptions,
            sessions = self.registry.len(),
        );
    }

    /// Sends one `Shutdown` frame to every session, closes them and clears
    /// both registries.
    async fn shutdown(&mut self, reason: &str) {
        let notice = Event::shutdown(&self.config.server_id, reason);
        let sessions = self.registry.drain();
        let count = sessions.len();
        for mut session in sessions {
            if let Err(err) = session
                .connection
                .write_event(&notice, self.config.write_timeout)
                .await
            {
                debug!(
                    event = "relay_shutdown_notice_failed",
                    conn_id = %session.connection.conn_id(),
                    error = %err,
                );
            }
            session.connection.close(self.config.write_timeout).await;
        }
        info!(event = "relay_sessions_drained", count);
    }
}

fn listener_name(event: &Event) -> Option<&str> {
    match event.payload() {
        Value::String(name) if is_valid_event_name(name) => Some(name.as_str()),
        _ => None,
    }
}

fn read_failure_reason(err: &ConnectionError) -> &'static str {
    match err {
        ConnectionError::Frame(FrameError::Io(_)) => "read_error",
        ConnectionError::Frame(_) => "malformed_frame",
        ConnectionError::Timeout(_) => "read_timeout",
    }
}
