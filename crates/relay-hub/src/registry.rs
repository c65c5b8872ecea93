use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("ticket already registered: {0}")]
    DuplicateTicket(String),
    #[error("no live session for ticket: {0}")]
    UnknownSession(String),
}

/// An authenticated connection. The session owns its connection; dropping
/// the session closes it.
#[derive(Debug)]
pub struct Session<C> {
    pub ticket: String,
    pub identity: String,
    pub connection: C,
}

/// Session table plus the subscription table indexed both ways.
///
/// Only the dispatch loop touches a registry, so neither table is locked.
#[derive(Debug)]
pub struct Registry<C> {
    sessions: HashMap<String, Session<C>>,
    subscribers: HashMap<String, BTreeSet<String>>,
    subscriptions: HashMap<String, BTreeSet<String>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            subscribers: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        ticket: &str,
        identity: &str,
        connection: C,
    ) -> Result<(), RegistryError> {
        if self.sessions.contains_key(ticket) {
            return Err(RegistryError::DuplicateTicket(ticket.to_string()));
        }
        self.sessions.insert(
            ticket.to_string(),
            Session {
                ticket: ticket.to_string(),
                identity: identity.to_string(),
                connection,
            },
        );
        Ok(())
    }

    /// Removes the session and every subscription it holds. The session is
    /// handed back so the caller can close its connection.
    pub fn unregister(&mut self, ticket: &str) -> Option<Session<C>> {
        let session = self.sessions.remove(ticket)?;
        if let Some(names) = self.subscriptions.remove(ticket) {
            for name in names {
                self.detach(&name, ticket);
            }
        }
        Some(session)
    }

    pub fn subscribe(&mut self, ticket: &str, event_name: &str) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(ticket) {
            return Err(RegistryError::UnknownSession(ticket.to_string()));
        }
        self.subscribers
            .entry(event_name.to_string())
            .or_default()
            .insert(ticket.to_string());
        self.subscriptions
            .entry(ticket.to_string())
            .or_default()
            .insert(event_name.to_string());
        Ok(())
    }

    pub fn unsubscribe(&mut self, ticket: &str, event_name: &str) {
        self.detach(event_name, ticket);
        if let Some(names) = self.subscriptions.get_mut(ticket) {
            names.remove(event_name);
            if names.is_empty() {
                self.subscriptions.remove(ticket);
            }
        }
    }

    fn detach(&mut self, event_name: &str, ticket: &str) {
        if let Some(tickets) = self.subscribers.get_mut(event_name) {
            tickets.remove(ticket);
            if tickets.is_empty() {
                self.subscribers.remove(event_name);
            }
        }
    }

    /// Snapshot of the tickets subscribed to `event_name`, in ticket order.
    pub fn subscribers_of(&self, event_name: &str) -> Vec<String> {
        self.subscribers
            .get(event_name)
            .map(|tickets| tickets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions_of(&self, ticket: &str) -> Vec<String> {
        self.subscriptions
            .get(ticket)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn get(&self, ticket: &str) -> Option<&Session<C>> {
        self.sessions.get(ticket)
    }

    pub fn get_mut(&mut self, ticket: &str) -> Option<&mut Session<C>> {
        self.sessions.get_mut(ticket)
    }

    #[cfg(test)]
    pub fn contains(&self, ticket: &str) -> bool {
        self.sessions.contains_key(ticket)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connections(&self) -> impl Iterator<Item = (&String, &C)> {
        self.sessions
            .iter()
            .map(|(ticket, session)| (ticket, &session.connection))
    }

    /// Empties both tables, returning every session.
    pub fn drain(&mut self) -> Vec<Session<C>> {
        self.subscribers.clear();
        self.subscriptions.clear();
        let mut sessions = self
            .sessions
            .drain()
            .map(|(_, session)| session)
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| a.ticket.cmp(&b.ticket));
        sessions
    }
}
