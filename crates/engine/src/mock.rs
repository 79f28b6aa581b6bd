//! In-memory channel used by the engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chanvault_protocol::{Attachment, ChannelItem, Position};

use crate::transport::{ChannelTransport, TransportError, TransportFuture};

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy)]
pub enum Fail {
    /// Transient for the next `n` calls, then success.
    Transient(u32),
    /// Transient forever.
    AlwaysTransient,
    /// Fatal on every call.
    Fatal,
}

struct Message {
    item: ChannelItem,
    blob: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_position: u64,
    messages: BTreeMap<u64, Message>,
    send_failures: HashMap<String, Fail>,
    fetch_failures: HashMap<u64, Fail>,
    send_calls: HashMap<String, u32>,
    fetch_calls: HashMap<u64, u32>,
    fetch_latency: HashMap<u64, Duration>,
}

pub struct MockTransport {
    state: Mutex<State>,
    latency: Duration,
    reverse_listing: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_position: 1000,
                ..Default::default()
            }),
            latency: Duration::ZERO,
            reverse_listing: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long while counted as in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `list_items` returns newest first instead of ascending.
    pub fn with_reverse_listing(mut self) -> Self {
        self.reverse_listing = true;
        self
    }

    pub fn fail_send(&self, name: &str, fail: Fail) {
        self.state
            .lock()
            .unwrap()
            .send_failures
            .insert(name.to_string(), fail);
    }

    pub fn fail_fetch(&self, position: Position, fail: Fail) {
        self.state
            .lock()
            .unwrap()
            .fetch_failures
            .insert(position.0, fail);
    }

    /// Extra latency for fetching one position.
    pub fn delay_fetch(&self, position: Position, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .fetch_latency
            .insert(position.0, delay);
    }

    pub fn send_calls(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .send_calls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Text-only messages, oldest first.
    pub fn texts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| m.blob.is_none())
            .map(|m| m.item.content.clone())
            .collect()
    }

    /// Positions of messages with an attachment, ascending.
    pub fn blob_positions(&self) -> Vec<Position> {
        self.state
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| m.blob.is_some())
            .map(|m| m.item.position)
            .collect()
    }

    /// Appends a message directly, bypassing failure injection.
    pub fn push(&self, content: &str, attachment: Option<(&str, Vec<u8>)>) -> Position {
        let mut s = self.state.lock().unwrap();
        Self::append(&mut s, content.to_string(), attachment.map(|(n, b)| (n.to_string(), b)))
    }

    fn append(s: &mut State, content: String, attachment: Option<(String, Vec<u8>)>) -> Position {
        s.next_position += 1;
        let position = Position(s.next_position);
        let (attachments, blob) = match attachment {
            Some((name, data)) => (
                vec![Attachment {
                    name,
                    size: data.len() as u64,
                }],
                Some(data),
            ),
            None => (Vec::new(), None),
        };
        s.messages.insert(
            position.0,
            Message {
                item: ChannelItem {
                    position,
                    content,
                    attachments,
                },
                blob,
            },
        );
        position
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn check(plan: Option<&Fail>, calls: u32, what: &str) -> Result<(), TransportError> {
        match plan {
            Some(Fail::Fatal) => Err(TransportError::Fatal(format!("{what} rejected"))),
            Some(Fail::AlwaysTransient) => Err(TransportError::Transient(format!("{what} busy"))),
            Some(Fail::Transient(n)) if calls <= *n => {
                Err(TransportError::Transient(format!("{what} busy ({calls})")))
            }
            _ => Ok(()),
        }
    }
}

impl ChannelTransport for MockTransport {
    fn send_blob(&self, name: String, data: Vec<u8>) -> TransportFuture<'_, Position> {
        Box::pin(async move {
            let _guard = self.enter();
            tokio::time::sleep(self.latency).await;

            let mut s = self.state.lock().unwrap();
            let calls = {
                let c = s.send_calls.entry(name.clone()).or_insert(0);
                *c += 1;
                *c
            };
            let plan = s.send_failures.get(&name);
            Self::check(plan, calls, &name)?;
            Ok(Self::append(&mut s, String::new(), Some((name, data))))
        })
    }

    fn send_text(&self, content: String) -> TransportFuture<'_, Position> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            Ok(Self::append(&mut s, content, None))
        })
    }

    fn list_items(
        &self,
        after: Position,
        before: Position,
    ) -> TransportFuture<'_, Vec<ChannelItem>> {
        Box::pin(async move {
            let s = self.state.lock().unwrap();
            let mut items: Vec<ChannelItem> = s
                .messages
                .values()
                .filter(|m| m.item.position > after && m.item.position < before)
                .map(|m| m.item.clone())
                .collect();
            if self.reverse_listing {
                items.reverse();
            }
            Ok(items)
        })
    }

    fn recent_items(&self, limit: usize) -> TransportFuture<'_, Vec<ChannelItem>> {
        Box::pin(async move {
            let s = self.state.lock().unwrap();
            Ok(s.messages
                .values()
                .rev()
                .take(limit)
                .map(|m| m.item.clone())
                .collect())
        })
    }

    fn fetch_blob(&self, position: Position) -> TransportFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let _guard = self.enter();
            let extra = self
                .state
                .lock()
                .unwrap()
                .fetch_latency
                .get(&position.0)
                .copied()
                .unwrap_or_default();
            tokio::time::sleep(self.latency + extra).await;

            let mut s = self.state.lock().unwrap();
            let calls = {
                let c = s.fetch_calls.entry(position.0).or_insert(0);
                *c += 1;
                *c
            };
            let plan = s.fetch_failures.get(&position.0);
            Self::check(plan, calls, &format!("fetch {position}"))?;
            s.messages
                .get(&position.0)
                .and_then(|m| m.blob.clone())
                .ok_or_else(|| TransportError::Fatal(format!("no attachment at {position}")))
        })
    }

    fn channel_id(&self) -> &str {
        "mock"
    }
}
