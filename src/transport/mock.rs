//! Scripted in-memory transport for tests and simulations.

use super::Transport;
use crate::codec::Wire;
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct MockState {
    /// Replies served once, before the persistent ones
    queued: HashMap<String, VecDeque<Wire>>,
    /// Replies served every time
    replies: HashMap<String, Wire>,
    /// `HEADER value` writes, answered by `HEADER?`
    settings: HashMap<String, String>,
    /// Reply waiting for the next read
    pending: VecDeque<Wire>,
    writes: Vec<String>,
    queries: HashMap<String, usize>,
    fail_next: Option<String>,
}

/// Transport answering queries from a table.
///
/// A write such as `VOLT 5` is remembered, so a later `VOLT?` replies `5`
/// unless an explicit reply was configured for that query.
///
/// # Example
///
/// ```
/// use instrument_core::transport::{MockTransport, Transport};
///
/// let mock = MockTransport::new().with_reply("*IDN?", "ACME,DMM1,123,1.0");
/// mock.write("VOLT 5").unwrap();
/// assert_eq!(mock.ask("VOLT?", false).unwrap().into_text().unwrap(), "5");
/// assert_eq!(mock.query_count("VOLT?"), 1);
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    name: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Empty mock.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Resource name reported by [`Transport::description`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Always answer `query` with `reply`.
    pub fn with_reply(self, query: &str, reply: impl Into<Wire>) -> Self {
        self.set_reply(query, reply);
        self
    }

    /// Replace the persistent reply to `query`.
    pub fn set_reply(&self, query: &str, reply: impl Into<Wire>) {
        self.state.lock().replies.insert(query.to_string(), reply.into());
    }

    /// Answer `query` with `reply` once.
    pub fn queue_reply(&self, query: &str, reply: impl Into<Wire>) {
        self.state
            .lock()
            .queued
            .entry(query.to_string())
            .or_default()
            .push_back(reply.into());
    }

    /// Make the next write fail with a communication error.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().fail_next = Some(message.into());
    }

    /// Every command written so far.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// How many times `query` was sent.
    pub fn query_count(&self, query: &str) -> usize {
        self.state.lock().queries.get(query).copied().unwrap_or(0)
    }

    /// Forget the write log and query counts.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.queries.clear();
    }
}

impl Transport for MockTransport {
    fn write(&self, command: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(DaqError::Communication(message));
        }
        let command = command.trim().to_string();
        state.writes.push(command.clone());

        let queued = state.queued.get_mut(&command).and_then(VecDeque::pop_front);
        let reply = queued.or_else(|| state.replies.get(&command).cloned());
        if let Some(reply) = reply {
            *state.queries.entry(command).or_default() += 1;
            state.pending.push_back(reply);
            return Ok(());
        }
        if let Some(header) = command.strip_suffix('?') {
            *state.queries.entry(command.clone()).or_default() += 1;
            let value = state.settings.get(header.trim()).cloned().ok_or_else(|| {
                DaqError::Communication(format!("no reply configured for {command:?}"))
            })?;
            state.pending.push_back(Wire::Text(value));
        } else if let Some((header, value)) = command.split_once(' ') {
            state
                .settings
                .insert(header.to_string(), value.trim().to_string());
        }
        Ok(())
    }

    fn read(&self, raw: bool) -> AppResult<Wire> {
        let reply = self
            .state
            .lock()
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::Communication("read timeout: nothing to read".into()))?;
        Ok(if raw {
            Wire::Bytes(reply.into_bytes())
        } else {
            reply
        })
    }

    fn description(&self) -> String {
        self.name.clone()
    }
}
