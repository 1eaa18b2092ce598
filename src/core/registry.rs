/// Request/response correlation
///
/// Every outbound request registers its id here before the bytes hit the
/// socket; the inbound dispatcher resolves the id when the matching reply
/// frame arrives. The registry is sharded so concurrent registration and
/// resolution on different ids never contend on one lock.
///
/// Lock ordering: shard mutexes are acquired one at a time and never nested;
/// a chained group's mutex is a leaf, never held while touching a shard.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use crate::core::ServerAddress;
use crate::error::{DriverError, DriverResult};
use crate::wire::{RawReply, RequestIdSource};

const SHARD_COUNT: usize = 16;

/// Resolved value of one operation: a single reply frame, or the accumulated
/// frames of a chained request group in registration order.
#[derive(Debug)]
pub struct OperationReply {
    pub frames: Vec<RawReply>,
}

impl OperationReply {
    pub fn single(frame: RawReply) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn first(&self) -> Option<&RawReply> {
        self.frames.first()
    }
}

type ReplySender = oneshot::Sender<DriverResult<OperationReply>>;

struct PendingRequest {
    address: ServerAddress,
    sender: ReplySender,
}

/// Shared state of a chained request group. The final id owns the sender;
/// intermediate ids only accumulate their frames.
struct ChainGroup {
    ids: Vec<i32>,
    final_id: i32,
    address: ServerAddress,
    frames: Vec<RawReply>,
    sender: Option<ReplySender>,
}

enum PendingEntry {
    Single(PendingRequest),
    Chained(Arc<Mutex<ChainGroup>>),
}

impl PendingEntry {
    fn address(&self) -> ServerAddress {
        match self {
            PendingEntry::Single(req) => req.address.clone(),
            PendingEntry::Chained(group) => lock(group).address.clone(),
        }
    }
}

pub struct CallbackRegistry {
    ids: RequestIdSource,
    shards: Vec<Mutex<HashMap<i32, PendingEntry>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            ids: RequestIdSource::new(),
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn next_request_id(&self) -> i32 {
        self.ids.next()
    }

    fn shard(&self, id: i32) -> &Mutex<HashMap<i32, PendingEntry>> {
        &self.shards[(id as u32 as usize) % SHARD_COUNT]
    }

    /// Register a single request id before its bytes are written.
    pub fn register(
        &self,
        id: i32,
        address: ServerAddress,
    ) -> oneshot::Receiver<DriverResult<OperationReply>> {
        let (sender, receiver) = oneshot::channel();
        lock(self.shard(id)).insert(id, PendingEntry::Single(PendingRequest { address, sender }));
        receiver
    }

    /// Register a chained request group: the ids belong to messages written
    /// back to back on one connection, the last id completes the group, and
    /// the replies to the earlier ids are accumulated rather than surfaced
    /// individually.
    pub fn register_chained(
        &self,
        ids: &[i32],
        address: ServerAddress,
    ) -> oneshot::Receiver<DriverResult<OperationReply>> {
        let (sender, receiver) = oneshot::channel();
        let final_id = *ids.last().unwrap_or(&0);
        let group = Arc::new(Mutex::new(ChainGroup {
            ids: ids.to_vec(),
            final_id,
            address,
            frames: Vec::with_capacity(ids.len()),
            sender: Some(sender),
        }));
        for &id in ids {
            lock(self.shard(id)).insert(id, PendingEntry::Chained(Arc::clone(&group)));
        }
        receiver
    }

    /// Deliver one reply frame to whichever request it answers. Replies to
    /// unknown ids are dropped; the request may have already timed out or
    /// been failed by a connection error. Returns whether the reply found
    /// its request.
    pub fn resolve(&self, reply: RawReply) -> bool {
        let id = reply.header.response_to;
        let entry = lock(self.shard(id)).remove(&id);
        match entry {
            None => {
                trace!("Dropping reply to unknown request id {}", id);
                false
            }
            Some(PendingEntry::Single(req)) => {
                let _ = req.sender.send(Ok(OperationReply::single(reply)));
                true
            }
            Some(PendingEntry::Chained(group)) => {
                let mut group = lock(&group);
                group.frames.push(reply);
                if id == group.final_id {
                    if let Some(sender) = group.sender.take() {
                        let frames = std::mem::take(&mut group.frames);
                        let _ = sender.send(Ok(OperationReply { frames }));
                    }
                }
                true
            }
        }
    }

    /// Fail one request id. A chained id fails its whole group: every
    /// sibling id is withdrawn and the group's callback fires exactly once.
    pub fn resolve_error(&self, id: i32, error: DriverError) {
        let entry = lock(self.shard(id)).remove(&id);
        match entry {
            None => {}
            Some(PendingEntry::Single(req)) => {
                let _ = req.sender.send(Err(error));
            }
            Some(PendingEntry::Chained(group)) => {
                let siblings: Vec<i32> = lock(&group).ids.clone();
                for sibling in siblings {
                    if sibling != id {
                        lock(self.shard(sibling)).remove(&sibling);
                    }
                }
                if let Some(sender) = lock(&group).sender.take() {
                    let _ = sender.send(Err(error));
                }
            }
        }
    }

    /// Fail every pending request. The factory produces one error per
    /// callback; chained groups fire once no matter how many ids they hold.
    pub fn resolve_all_with_error<F>(&self, make_error: F)
    where
        F: Fn() -> DriverError,
    {
        for shard in &self.shards {
            let drained: Vec<PendingEntry> = lock(shard).drain().map(|(_, e)| e).collect();
            for entry in drained {
                Self::fail_entry(entry, &make_error);
            }
        }
    }

    /// Fail every pending request that was issued against one server. Used
    /// when a server dies while its siblings keep working.
    pub fn resolve_all_for_address<F>(&self, address: &ServerAddress, make_error: F)
    where
        F: Fn() -> DriverError,
    {
        for shard in &self.shards {
            let mut matched = Vec::new();
            {
                let mut map = lock(shard);
                let ids: Vec<i32> = map
                    .iter()
                    .filter(|(_, e)| &e.address() == address)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(entry) = map.remove(&id) {
                        matched.push(entry);
                    }
                }
            }
            for entry in matched {
                Self::fail_entry(entry, &make_error);
            }
        }
    }

    fn fail_entry<F>(entry: PendingEntry, make_error: &F)
    where
        F: Fn() -> DriverError,
    {
        match entry {
            PendingEntry::Single(req) => {
                let _ = req.sender.send(Err(make_error()));
            }
            PendingEntry::Chained(group) => {
                // Sibling ids drain out of their own shards; only the first
                // one reaching the sender fires the callback.
                if let Some(sender) = lock(&group).sender.take() {
                    let _ = sender.send(Err(make_error()));
                }
            }
        }
    }

    /// Number of registered ids still awaiting a reply (chained groups count
    /// once per id).
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
