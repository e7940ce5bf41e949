//! The keyspace and its operations.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::ops::Bound;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::debug;

use cinnabar_reactor::{JobHandle, LoopHandle};
use cinnabar_types::{BoundStreamId, InputStreamId, ReadStreamId, StreamId, StreamWaiterId};

use crate::error::{StoreError, StoreResult};
use crate::value::{StreamValue, StringValue, Value};

/// What a key currently holds, as reported to `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    None,
    String,
    Stream,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::String => write!(f, "string"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// One stream entry: its ID and field/value pairs in insertion order.
pub type StreamEntry = (StreamId, Vec<(Bytes, Bytes)>);

/// Entries collected from one stream by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReadResult {
    pub key: String,
    pub entries: Vec<StreamEntry>,
}

type WaiterReply = Box<dyn FnOnce(Vec<StreamReadResult>)>;

/// A blocked stream read: materialized cursors, the pending reply, and the
/// timeout armed for it.
struct StreamWaiter {
    requests: Vec<(String, StreamId)>,
    reply: WaiterReply,
    timer: JobHandle,
}

/// A waiter plucked out of the arena, ready to fire.
///
/// Returned instead of invoked so the caller can release its borrow of the
/// store first; the reply may well re-enter storage.
pub struct ResolvedRead {
    reply: WaiterReply,
    results: Vec<StreamReadResult>,
    timer: JobHandle,
}

impl fmt::Debug for ResolvedRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedRead")
            .field("results", &self.results)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

impl ResolvedRead {
    /// Cancels the pending timeout and delivers the results.
    pub fn fire(self) {
        self.timer.invalidate();
        (self.reply)(self.results);
    }
}

/// Milliseconds since the Unix epoch, for generated stream entry IDs.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// The in-memory keyspace.
///
/// # Invariants
///
/// - A key maps to exactly one of: absent, string value, stream value.
/// - Stream entry IDs strictly increase per key; `0-0` is never stored.
/// - A string value whose expiry has passed is semantically absent: reads
///   do not return it and remove it when they see it.
#[derive(Default)]
pub struct Store {
    keys: HashMap<String, Value>,
    waiters: HashMap<StreamWaiterId, StreamWaiter>,
    next_waiter: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key` as a string value.
    ///
    /// No kind preservation: a set against a stream key replaces it.
    pub fn set(&mut self, key: String, value: Bytes, expire_ms: Option<u64>) {
        let expire_at = expire_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.keys
            .insert(key, Value::Str(StringValue::new(value, expire_at)));
    }

    /// The string value stored at `key`, if it is a live string.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        match self.keys.get(key) {
            Some(Value::Str(value)) if value.expired_at(Instant::now()) => {
                self.keys.remove(key);
                None
            }
            Some(Value::Str(value)) => Some(value.data.clone()),
            Some(Value::Stream(_)) | None => None,
        }
    }

    /// The kind of value held at `key`.
    pub fn kind(&mut self, key: &str) -> ValueKind {
        match self.keys.get(key) {
            Some(Value::Str(value)) if value.expired_at(Instant::now()) => {
                self.keys.remove(key);
                ValueKind::None
            }
            Some(Value::Str(_)) => ValueKind::String,
            Some(Value::Stream(_)) => ValueKind::Stream,
            None => ValueKind::None,
        }
    }

    /// All live keys. The `KEYS` pattern is accepted but not interpreted:
    /// every pattern matches everything.
    pub fn keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.keys
            .retain(|_, value| !matches!(value, Value::Str(s) if s.expired_at(now)));
        self.keys.keys().cloned().collect()
    }

    /// Appends an entry, allocating its concrete ID at the current wall
    /// clock. See [`Store::xadd_at`].
    pub fn xadd(
        &mut self,
        key: &str,
        id: InputStreamId,
        fields: Vec<(Bytes, Bytes)>,
    ) -> StoreResult<(StreamId, Vec<ResolvedRead>)> {
        self.xadd_at(key, id, fields, unix_ms())
    }

    /// Appends an entry with an explicit wall-clock reading, resolving any
    /// blocked readers the append satisfies.
    ///
    /// The resolved readers are returned, not invoked; call
    /// [`ResolvedRead::fire`] once no borrow of the store is held.
    pub fn xadd_at(
        &mut self,
        key: &str,
        id: InputStreamId,
        fields: Vec<(Bytes, Bytes)>,
        now_ms: u64,
    ) -> StoreResult<(StreamId, Vec<ResolvedRead>)> {
        let top = match self.keys.get(key) {
            Some(Value::Stream(stream)) => stream.top(),
            Some(Value::Str(_)) => return Err(StoreError::WrongType),
            None => None,
        };

        // Allocate before touching the map: a rejected append must not
        // leave an empty stream behind.
        let allocated = allocate_id(top, id, now_ms)?;
        match self.keys.get_mut(key) {
            Some(Value::Stream(stream)) => {
                stream.entries.insert(allocated, fields);
            }
            _ => {
                let mut stream = StreamValue::default();
                stream.entries.insert(allocated, fields);
                self.keys.insert(key.to_owned(), Value::Stream(stream));
            }
        }
        debug!(key, id = %allocated, "stream append");

        let fired = self.resolve_waiters_watching(key);
        Ok((allocated, fired))
    }

    /// Entries with IDs in `[start, end]`, extremes substituted for the
    /// unbound forms.
    pub fn xrange(
        &mut self,
        key: &str,
        start: BoundStreamId,
        end: BoundStreamId,
    ) -> StoreResult<Vec<StreamEntry>> {
        let lo = start.resolve(StreamId::MIN);
        let hi = end.resolve(StreamId::MAX);
        match self.keys.get(key) {
            Some(Value::Stream(stream)) => Ok(stream
                .entries
                .range(lo..=hi)
                .map(|(id, pairs)| (*id, pairs.clone()))
                .collect()),
            Some(Value::Str(_)) => Err(StoreError::WrongType),
            None => Ok(Vec::new()),
        }
    }

    /// Resolves `$` cursors to each stream's current top (or the zero ID
    /// for absent/empty streams), freezing the read position.
    pub fn materialize(&self, requests: &[(String, ReadStreamId)]) -> Vec<(String, StreamId)> {
        requests
            .iter()
            .map(|(key, id)| {
                let id = match id {
                    ReadStreamId::Exact(id) => *id,
                    ReadStreamId::Latest => self.top_of(key).unwrap_or(StreamId::MIN),
                };
                (key.clone(), id)
            })
            .collect()
    }

    fn top_of(&self, key: &str) -> Option<StreamId> {
        match self.keys.get(key) {
            Some(Value::Stream(stream)) => stream.top(),
            _ => None,
        }
    }

    /// Entries strictly after each cursor; only streams with something new
    /// appear in the result.
    pub fn xread_collect(&self, requests: &[(String, StreamId)]) -> Vec<StreamReadResult> {
        requests
            .iter()
            .filter_map(|(key, after)| {
                let Some(Value::Stream(stream)) = self.keys.get(key) else {
                    return None;
                };
                let entries: Vec<StreamEntry> = stream
                    .entries
                    .range((Bound::Excluded(*after), Bound::Unbounded))
                    .map(|(id, pairs)| (*id, pairs.clone()))
                    .collect();
                if entries.is_empty() {
                    None
                } else {
                    Some(StreamReadResult {
                        key: key.clone(),
                        entries,
                    })
                }
            })
            .collect()
    }

    /// Parks a blocked read. The caller arms its timeout separately and
    /// attaches the handle via [`Store::attach_waiter_timer`].
    pub fn register_waiter(
        &mut self,
        requests: Vec<(String, StreamId)>,
        reply: WaiterReply,
    ) -> StreamWaiterId {
        let id = StreamWaiterId::new(self.next_waiter);
        self.next_waiter += 1;
        self.waiters.insert(
            id,
            StreamWaiter {
                requests,
                reply,
                timer: JobHandle::detached(),
            },
        );
        id
    }

    /// Attaches the timeout armed for a parked read, so resolution through
    /// an append can cancel it.
    pub fn attach_waiter_timer(&mut self, id: StreamWaiterId, timer: JobHandle) {
        if let Some(waiter) = self.waiters.get_mut(&id) {
            waiter.timer = timer;
        }
    }

    /// Removes a timed-out read, handing back whatever is now available —
    /// possibly nothing.
    pub fn take_expired_waiter(&mut self, id: StreamWaiterId) -> Option<ResolvedRead> {
        let waiter = self.waiters.remove(&id)?;
        let results = self.xread_collect(&waiter.requests);
        Some(ResolvedRead {
            reply: waiter.reply,
            results,
            timer: waiter.timer,
        })
    }

    /// Drops a parked read without replying, cancelling its timeout. Used
    /// when the blocked connection goes away.
    pub fn cancel_waiter(&mut self, id: StreamWaiterId) {
        if let Some(waiter) = self.waiters.remove(&id) {
            waiter.timer.invalidate();
        }
    }

    fn resolve_waiters_watching(&mut self, key: &str) -> Vec<ResolvedRead> {
        let watching: Vec<StreamWaiterId> = self
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.requests.iter().any(|(k, _)| k == key))
            .map(|(id, _)| *id)
            .collect();

        let mut fired = Vec::new();
        for id in watching {
            let results = self.xread_collect(&self.waiters[&id].requests);
            if results.is_empty() {
                continue;
            }
            let waiter = self.waiters.remove(&id).expect("waiter id just listed");
            fired.push(ResolvedRead {
                reply: waiter.reply,
                results,
                timer: waiter.timer,
            });
        }
        fired
    }

    /// Reinserts a key from the startup snapshot.
    ///
    /// `expire_at_unix_ms` is the absolute wall-clock expiry recorded in
    /// the file; entries already past it are skipped. Returns whether the
    /// key was kept.
    pub fn restore(&mut self, key: String, value: Bytes, expire_at_unix_ms: Option<u64>) -> bool {
        let expire_at = match expire_at_unix_ms {
            None => None,
            Some(at_ms) => {
                let now_ms = unix_ms();
                if at_ms <= now_ms {
                    debug!(%key, "skipping expired snapshot entry");
                    return false;
                }
                Some(Instant::now() + Duration::from_millis(at_ms - now_ms))
            }
        };
        self.keys
            .insert(key, Value::Str(StringValue::new(value, expire_at)));
        true
    }

    /// Number of parked reads, for tests and introspection.
    pub fn waiting_readers(&self) -> usize {
        self.waiters.len()
    }
}

/// Applies the append ID rules against the stream's current top entry.
fn allocate_id(
    top: Option<StreamId>,
    input: InputStreamId,
    now_ms: u64,
) -> StoreResult<StreamId> {
    if input == InputStreamId::Exact(StreamId::MIN) {
        return Err(StoreError::ZeroStreamId);
    }

    let allocated = match top {
        None => match input {
            InputStreamId::Wildcard => StreamId::new(now_ms, 0),
            // The very first entry under 0-* starts at 0-1: 0-0 is never
            // stored.
            InputStreamId::SeqWildcard { ms: 0 } => StreamId::new(0, 1),
            InputStreamId::SeqWildcard { ms } => StreamId::new(ms, 0),
            InputStreamId::Exact(id) => id,
        },
        Some(top) => match input {
            InputStreamId::Wildcard => {
                if now_ms > top.ms {
                    StreamId::new(now_ms, 0)
                } else {
                    StreamId::new(top.ms, top.seq + 1)
                }
            }
            InputStreamId::SeqWildcard { ms } => {
                if ms < top.ms {
                    return Err(StoreError::NonMonotonicStreamId);
                } else if ms == top.ms {
                    StreamId::new(ms, top.seq + 1)
                } else {
                    StreamId::new(ms, 0)
                }
            }
            InputStreamId::Exact(id) => {
                if id <= top {
                    return Err(StoreError::NonMonotonicStreamId);
                }
                id
            }
        },
    };
    Ok(allocated)
}

/// The store behind the single-threaded shared handle the server uses.
///
/// Callbacks for blocked reads fire here, after the mutable borrow of the
/// underlying [`Store`] is released.
#[derive(Clone)]
pub struct SharedStore {
    inner: Rc<RefCell<Store>>,
    loop_handle: LoopHandle,
}

impl SharedStore {
    pub fn new(store: Store, loop_handle: LoopHandle) -> Self {
        Self {
            inner: Rc::new(RefCell::new(store)),
            loop_handle,
        }
    }

    pub fn set(&self, key: String, value: Bytes, expire_ms: Option<u64>) {
        self.inner.borrow_mut().set(key, value, expire_ms);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.borrow_mut().get(key)
    }

    pub fn kind(&self, key: &str) -> ValueKind {
        self.inner.borrow_mut().kind(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.borrow_mut().keys()
    }

    /// Appends an entry and delivers any reads the append unblocked.
    pub fn xadd(
        &self,
        key: &str,
        id: InputStreamId,
        fields: Vec<(Bytes, Bytes)>,
    ) -> StoreResult<StreamId> {
        let (allocated, fired) = self.inner.borrow_mut().xadd(key, id, fields)?;
        for resolved in fired {
            resolved.fire();
        }
        Ok(allocated)
    }

    pub fn xrange(
        &self,
        key: &str,
        start: BoundStreamId,
        end: BoundStreamId,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.inner.borrow_mut().xrange(key, start, end)
    }

    /// Reads entries after each cursor, replying through `reply`.
    ///
    /// Without `block_ms`, or when something is immediately available, the
    /// reply is synchronous and `None` is returned. Otherwise the read
    /// parks until the next satisfying append or until the timeout
    /// delivers whatever exists then (possibly nothing); the parked
    /// waiter's ID comes back so the caller can cancel it if its
    /// connection goes away.
    pub fn xread(
        &self,
        requests: &[(String, ReadStreamId)],
        block_ms: Option<u64>,
        reply: impl FnOnce(Vec<StreamReadResult>) + 'static,
    ) -> Option<StreamWaiterId> {
        let (materialized, immediate) = {
            let store = self.inner.borrow();
            let materialized = store.materialize(requests);
            let immediate = store.xread_collect(&materialized);
            (materialized, immediate)
        };

        let Some(block_ms) = block_ms else {
            reply(immediate);
            return None;
        };
        if !immediate.is_empty() {
            reply(immediate);
            return None;
        }

        let id = self
            .inner
            .borrow_mut()
            .register_waiter(materialized, Box::new(reply));
        let store = self.clone();
        let timer = self
            .loop_handle
            .set_timeout(Duration::from_millis(block_ms), move || {
                let resolved = store.inner.borrow_mut().take_expired_waiter(id);
                if let Some(resolved) = resolved {
                    resolved.fire();
                }
            });
        self.inner.borrow_mut().attach_waiter_timer(id, timer);
        Some(id)
    }

    pub fn cancel_waiter(&self, id: StreamWaiterId) {
        self.inner.borrow_mut().cancel_waiter(id);
    }

    pub fn restore(&self, key: String, value: Bytes, expire_at_unix_ms: Option<u64>) -> bool {
        self.inner
            .borrow_mut()
            .restore(key, value, expire_at_unix_ms)
    }

    /// Runs `f` with direct access to the underlying store.
    pub fn with<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}
