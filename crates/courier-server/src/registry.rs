use std::collections::HashSet;
use std::sync::Arc;

use courier_core::{ConnectionId, Identity, OfferId, Role};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// What a connection's writer task is asked to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Send one encoded text frame.
    Frame(Arc<str>),
    /// Send a close frame and stop.
    Close { code: u16, reason: String },
}

/// Result of offering a frame to one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue full; the frame was dropped and the connection kept.
    Dropped,
    /// Writer gone; the connection should be unregistered.
    Closed,
}

/// Offer `msg` to `tx` without waiting.
pub fn offer(tx: &mpsc::Sender<Outbound>, msg: Outbound) -> SendOutcome {
    match tx.try_send(msg) {
        Ok(()) => SendOutcome::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
        Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
    }
}

struct Handle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

/// One identity's state on this instance.
#[derive(Default)]
struct Connections {
    handles: Vec<Handle>,
    /// Offers marked by any of the identity's connections.
    viewing: HashSet<OfferId>,
}

/// Outcome of removing a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unregistered {
    pub identity: Identity,
    /// The identity has no other connection on this instance.
    pub last: bool,
    /// Offers still marked as viewed. Only filled when `last`.
    pub viewing: Vec<OfferId>,
}

/// Live connections on this instance, grouped by identity.
///
/// An identity may hold several connections at once (two phones, a
/// reconnect racing the old socket); every frame addressed to it goes to all
/// of them. Viewing state belongs to the identity and is handed back when
/// its last connection is removed.
pub struct ConnectionRegistry {
    by_identity: DashMap<Identity, Connections>,
    owners: DashMap<ConnectionId, Identity>,
    /// Connections removed because their writer was gone, kept until the
    /// connection's own [`ConnectionRegistry::unregister`] call collects them.
    reaped: DashMap<ConnectionId, Unregistered>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            by_identity: DashMap::new(),
            owners: DashMap::new(),
            reaped: DashMap::new(),
            max_send_queue,
        }
    }

    /// A fresh outbound queue sized for one connection.
    pub fn channel(&self) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(self.max_send_queue)
    }

    /// Add a connection for `identity`. Registering the same connection id
    /// twice is a no-op and returns false.
    pub fn register(&self, identity: &Identity, id: ConnectionId, tx: mpsc::Sender<Outbound>) -> bool {
        match self.owners.entry(id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(identity.clone());
            }
        }
        self.by_identity
            .entry(identity.clone())
            .or_default()
            .handles
            .push(Handle { id, tx });
        true
    }

    /// Record that `identity` is viewing `offer`. False if the identity has
    /// no connection here.
    pub fn mark_viewing(&self, identity: &Identity, offer: OfferId) -> bool {
        match self.by_identity.get_mut(identity) {
            Some(mut conns) => {
                conns.viewing.insert(offer);
                true
            }
            None => false,
        }
    }

    pub fn stop_viewing(&self, identity: &Identity, offer: OfferId) {
        if let Some(mut conns) = self.by_identity.get_mut(identity) {
            conns.viewing.remove(&offer);
        }
    }

    /// Remove a connection. Drops the identity's entry once it is empty.
    ///
    /// A connection already reaped by a failed delivery is still reported
    /// here once, so its cleanup is not lost.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Unregistered> {
        if let Some(gone) = self.detach(id) {
            return Some(gone);
        }
        let (_, mut gone) = self.reaped.remove(id)?;
        if gone.last {
            // The identity reconnected after the reap; its live entry takes
            // over the viewing state.
            if let Some(mut live) = self.by_identity.get_mut(&gone.identity) {
                live.viewing.extend(gone.viewing.drain(..));
                gone.last = false;
            }
        }
        Some(gone)
    }

    /// Queue `frame` on every connection of `identity`. Returns how many
    /// connections accepted it. Connections whose writer is gone are removed.
    pub fn deliver_local(&self, identity: &Identity, frame: &str) -> usize {
        let frame: Arc<str> = Arc::from(frame);
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(conns) = self.by_identity.get(identity) {
            for handle in conns.handles.iter() {
                match offer(&handle.tx, Outbound::Frame(frame.clone())) {
                    SendOutcome::Queued => delivered += 1,
                    SendOutcome::Dropped => {
                        tracing::warn!(
                            identity_id = %identity.id,
                            connection_id = %handle.id,
                            frame_len = frame.len(),
                            "Send queue full, dropping frame"
                        );
                    }
                    SendOutcome::Closed => closed.push(handle.id.clone()),
                }
            }
        }

        self.reap(closed);
        delivered
    }

    /// Queue `frame` on every connection of every identity with `role`.
    pub fn broadcast_local(&self, role: Role, frame: &str) -> usize {
        let targets: Vec<Identity> = self
            .by_identity
            .iter()
            .filter(|entry| entry.key().role == role)
            .map(|entry| entry.key().clone())
            .collect();
        targets.iter().map(|identity| self.deliver_local(identity, frame)).sum()
    }

    /// Ask every connection to close. Used on shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.by_identity.iter() {
            for handle in &entry.value().handles {
                let _ = offer(
                    &handle.tx,
                    Outbound::Close {
                        code,
                        reason: reason.to_owned(),
                    },
                );
            }
        }
    }

    /// Identities of `role` with at least one live connection here.
    pub fn count_local(&self, role: Role) -> usize {
        self.by_identity.iter().filter(|entry| entry.key().role == role).count()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Remove `id` from the live maps. `last` is decided under the same
    /// shard lock that removes the identity entry, so a concurrent
    /// registration either lands first (not last) or creates a fresh entry.
    fn detach(&self, id: &ConnectionId) -> Option<Unregistered> {
        let (_, identity) = self.owners.remove(id)?;
        let viewing = match self.by_identity.entry(identity.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().handles.retain(|h| &h.id != id);
                if slot.get().handles.is_empty() {
                    Some(slot.remove().viewing)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => Some(HashSet::new()),
        };
        Some(Unregistered {
            identity,
            last: viewing.is_some(),
            viewing: viewing.map(|v| v.into_iter().collect()).unwrap_or_default(),
        })
    }

    fn reap(&self, closed: Vec<ConnectionId>) {
        for id in closed {
            if let Some(gone) = self.detach(&id) {
                tracing::debug!(
                    identity_id = %gone.identity.id,
                    connection_id = %id,
                    last = gone.last,
                    "Removed connection with closed writer"
                );
                self.reaped.insert(id, gone);
            }
        }
    }
}
