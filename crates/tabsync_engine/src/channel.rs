//! Cross-context message channel.
//!
//! Contexts exchange immutable JSON strings. Each context owns one endpoint
//! with its own inbox; a post reaches every *other* endpoint currently open
//! under the same name. Delivery is at-most-once: closed endpoints miss
//! messages and late joiners get no replay.

use crate::error::{ChannelError, ChannelResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Weak};

/// One context's view of the cross-context channel.
///
/// This trait abstracts the messaging layer, allowing for different
/// implementations (in-process hub, disabled, custom transports).
pub trait Channel: Send + Sync {
    /// Posts a message to every other open endpoint.
    fn post(&self, message: &str) -> ChannelResult<()>;

    /// Takes the next message from this endpoint's inbox.
    fn try_recv(&self) -> Option<String>;

    /// Closes the endpoint. Later posts fail and nothing more is received.
    fn close(&self);

    /// Returns true until [`Channel::close`] is called.
    fn is_open(&self) -> bool;
}

type Peers = HashMap<String, Vec<(u64, Sender<String>)>>;

/// Registry of named channels shared by a set of contexts.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct ChannelHub {
    peers: Arc<Mutex<Peers>>,
    next_id: Arc<AtomicU64>,
}

impl ChannelHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new endpoint on the channel `name`.
    pub fn open(&self, name: &str) -> ChannelEndpoint {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.peers
            .lock()
            .entry(name.to_string())
            .or_default()
            .push((id, tx));

        tracing::debug!(channel = name, endpoint = id, "channel endpoint opened");

        ChannelEndpoint {
            name: name.to_string(),
            id,
            hub: Arc::downgrade(&self.peers),
            inbox: Mutex::new(rx),
            open: AtomicBool::new(true),
        }
    }

    /// Returns the number of open endpoints on `name`.
    pub fn endpoint_count(&self, name: &str) -> usize {
        self.peers.lock().get(name).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.lock();
        f.debug_struct("ChannelHub")
            .field("channels", &peers.len())
            .finish()
    }
}

/// An endpoint opened through [`ChannelHub::open`].
pub struct ChannelEndpoint {
    name: String,
    id: u64,
    hub: Weak<Mutex<Peers>>,
    inbox: Mutex<Receiver<String>>,
    open: AtomicBool,
}

impl ChannelEndpoint {
    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn detach(&self) {
        if let Some(hub) = self.hub.upgrade() {
            let mut peers = hub.lock();
            if let Some(list) = peers.get_mut(&self.name) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    peers.remove(&self.name);
                }
            }
        }
    }
}

impl Channel for ChannelEndpoint {
    fn post(&self, message: &str) -> ChannelResult<()> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        let Some(hub) = self.hub.upgrade() else {
            return Err(ChannelError::Closed(self.name.clone()));
        };

        let mut peers = hub.lock();
        if let Some(list) = peers.get_mut(&self.name) {
            // Peers whose receiver is gone are pruned.
            list.retain(|(id, tx)| *id == self.id || tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        match self.inbox.lock().try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.detach();
            tracing::debug!(channel = %self.name, endpoint = self.id, "channel endpoint closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stand-in for environments without a cross-context channel.
///
/// Posts succeed and reach nobody; the context runs in single-context mode.
#[derive(Debug, Default)]
pub struct DisabledChannel;

impl DisabledChannel {
    /// Creates the channel, logging that cross-context sync is off.
    pub fn new() -> Self {
        tracing::warn!("cross-context channel unavailable; running in single-context mode");
        Self
    }
}

impl Channel for DisabledChannel {
    fn post(&self, _message: &str) -> ChannelResult<()> {
        Ok(())
    }

    fn try_recv(&self) -> Option<String> {
        None
    }

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }
}
