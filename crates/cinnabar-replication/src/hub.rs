//! The replica registry and WAIT bookkeeping.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use cinnabar_reactor::{JobHandle, LoopHandle};
use cinnabar_types::{ReplicaId, WaitId};
use cinnabar_wire::{Command, Frame};

/// Lifecycle of a registered follower.
///
/// Only `Write` followers receive propagated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Introduced itself via `REPLCONF`.
    Met,
    /// Full resync underway: snapshot queued, command stream not yet.
    Resync,
    /// Receiving the propagated write stream.
    Write,
}

type Outbox = Rc<RefCell<dyn FnMut(&Frame)>>;
type WaitReply = Box<dyn FnOnce(i64)>;

struct ReplicaHandle {
    state: ReplicaState,
    outbox: Outbox,
    bytes_pushed: u64,
    bytes_acked: u64,
}

struct WaitEntry {
    /// Acknowledged replicas the caller asked for.
    target: u64,
    /// Replicas known caught-up, counted at registration and on each ACK.
    ready: u64,
    /// Lagging replicas nudged with GETACK, and the pushed-byte threshold
    /// each must acknowledge.
    pending: HashMap<ReplicaId, u64>,
    reply: Option<WaitReply>,
    timer: JobHandle,
}

#[derive(Default)]
struct HubInner {
    replicas: HashMap<ReplicaId, ReplicaHandle>,
    waits: HashMap<WaitId, WaitEntry>,
    next_replica: u64,
    next_wait: u64,
    /// Cumulative wire bytes of every frame propagated to the stream.
    master_offset: u64,
}

/// A resolved WAIT plucked out under the borrow, fired after it.
struct ResolvedWait {
    reply: Option<WaitReply>,
    ready: i64,
    timer: JobHandle,
}

impl ResolvedWait {
    fn fire(self) {
        self.timer.invalidate();
        if let Some(reply) = self.reply {
            reply(self.ready);
        }
    }
}

/// Leader-side replication state: the follower registry, per-follower byte
/// counters, and outstanding WAIT entries.
#[derive(Clone)]
pub struct ReplicationHub {
    inner: Rc<RefCell<HubInner>>,
    loop_handle: LoopHandle,
}

impl ReplicationHub {
    pub fn new(loop_handle: LoopHandle) -> Self {
        Self {
            inner: Rc::new(RefCell::new(HubInner::default())),
            loop_handle,
        }
    }

    /// Registers a follower in `Met` state with its outbox slot.
    pub fn register(&self, outbox: impl FnMut(&Frame) + 'static) -> ReplicaId {
        let mut inner = self.inner.borrow_mut();
        let id = ReplicaId::new(inner.next_replica);
        inner.next_replica += 1;
        inner.replicas.insert(
            id,
            ReplicaHandle {
                state: ReplicaState::Met,
                outbox: Rc::new(RefCell::new(outbox)),
                bytes_pushed: 0,
                bytes_acked: 0,
            },
        );
        debug!(replica = %id, "follower registered");
        id
    }

    /// Marks a follower as mid-resync.
    pub fn mark_resync(&self, id: ReplicaId) {
        self.set_state(id, ReplicaState::Resync);
    }

    /// Promotes a follower to the propagated write stream.
    pub fn mark_write(&self, id: ReplicaId) {
        self.set_state(id, ReplicaState::Write);
    }

    fn set_state(&self, id: ReplicaId, state: ReplicaState) {
        if let Some(handle) = self.inner.borrow_mut().replicas.get_mut(&id) {
            trace!(replica = %id, ?state, "follower state change");
            handle.state = state;
        }
    }

    /// Drops a follower, e.g. when its connection tears down. Outstanding
    /// WAITs stop expecting it; their timers still bound the outcome.
    pub fn remove(&self, id: ReplicaId) {
        let mut inner = self.inner.borrow_mut();
        if inner.replicas.remove(&id).is_some() {
            debug!(replica = %id, "follower removed");
        }
        for entry in inner.waits.values_mut() {
            entry.pending.remove(&id);
        }
    }

    /// Number of followers receiving the write stream.
    pub fn write_replica_count(&self) -> usize {
        self.inner
            .borrow()
            .replicas
            .values()
            .filter(|r| r.state == ReplicaState::Write)
            .count()
    }

    /// Cumulative propagated bytes, as advertised in `INFO` and
    /// `FULLRESYNC`.
    pub fn master_offset(&self) -> u64 {
        self.inner.borrow().master_offset
    }

    /// Pushed/acked byte counters of one follower.
    pub fn counters(&self, id: ReplicaId) -> Option<(u64, u64)> {
        self.inner
            .borrow()
            .replicas
            .get(&id)
            .map(|r| (r.bytes_pushed, r.bytes_acked))
    }

    /// Fans a canonically re-encoded write out to every `Write` follower.
    pub fn propagate(&self, command: &Command) {
        let frame = command.to_frame();
        let len = frame.wire_len() as u64;

        let targets: Vec<(ReplicaId, Outbox)> = {
            let mut inner = self.inner.borrow_mut();
            inner.master_offset += len;
            inner
                .replicas
                .iter_mut()
                .filter(|(_, r)| r.state == ReplicaState::Write)
                .map(|(id, r)| {
                    r.bytes_pushed += len;
                    (*id, Rc::clone(&r.outbox))
                })
                .collect()
        };

        trace!(followers = targets.len(), len, "propagating write");
        for (_, outbox) in targets {
            (outbox.borrow_mut())(&frame);
        }
    }

    /// Records an acknowledgement from a follower and resolves any WAITs
    /// it satisfies. Acked bytes are monotonic: stale reports are kept at
    /// the high-water mark.
    pub fn ack(&self, id: ReplicaId, bytes: u64) {
        let resolved: Vec<ResolvedWait> = {
            let mut inner = self.inner.borrow_mut();
            let Some(handle) = inner.replicas.get_mut(&id) else {
                return;
            };
            handle.bytes_acked = handle.bytes_acked.max(bytes);
            let acked = handle.bytes_acked;
            trace!(replica = %id, acked, "follower ack");

            let mut done = Vec::new();
            for (wait_id, entry) in &mut inner.waits {
                let satisfied = entry
                    .pending
                    .get(&id)
                    .is_some_and(|threshold| acked >= *threshold);
                if satisfied {
                    entry.pending.remove(&id);
                    entry.ready += 1;
                    if entry.ready >= entry.target {
                        done.push(*wait_id);
                    }
                }
            }
            done.into_iter()
                .filter_map(|wait_id| {
                    inner.waits.remove(&wait_id).map(|entry| ResolvedWait {
                        ready: entry.ready as i64,
                        reply: entry.reply,
                        timer: entry.timer,
                    })
                })
                .collect()
        };

        for wait in resolved {
            wait.fire();
        }
    }

    /// Services `WAIT num_replicas timeout_ms`.
    ///
    /// Replies immediately when enough followers are already caught up;
    /// otherwise nudges each lagging follower with `REPLCONF GETACK *`,
    /// arms the timeout, and replies once acknowledgements reach the
    /// target or the timer fires — whichever comes first.
    pub fn wait(&self, num_replicas: u64, timeout_ms: u64, reply: impl FnOnce(i64) + 'static) {
        let getack = Command::ReplConf {
            args: vec!["GETACK".to_owned(), "*".to_owned()],
        }
        .to_frame();
        let getack_len = getack.wire_len() as u64;

        enum Outcome {
            Now(i64, Box<dyn FnOnce(i64)>),
            Armed(WaitId, Vec<Outbox>),
        }

        let outcome = {
            let mut inner = self.inner.borrow_mut();

            let total = inner
                .replicas
                .values()
                .filter(|r| r.state == ReplicaState::Write)
                .count() as u64;
            let ready = inner
                .replicas
                .values()
                .filter(|r| r.state == ReplicaState::Write && r.bytes_acked >= r.bytes_pushed)
                .count() as u64;

            // An empty registry never replies early for a nonzero target:
            // it waits the timeout out.
            if ready >= num_replicas || (total > 0 && ready == total) {
                Outcome::Now(ready as i64, Box::new(reply))
            } else {
                let mut pending = HashMap::new();
                let mut nudges = Vec::new();
                for (id, handle) in &mut inner.replicas {
                    if handle.state != ReplicaState::Write
                        || handle.bytes_acked >= handle.bytes_pushed
                    {
                        continue;
                    }
                    // Threshold is the stream position before the nudge
                    // itself goes out.
                    pending.insert(*id, handle.bytes_pushed);
                    handle.bytes_pushed += getack_len;
                    nudges.push(Rc::clone(&handle.outbox));
                }
                if !nudges.is_empty() {
                    inner.master_offset += getack_len;
                }

                let wait_id = WaitId::new(inner.next_wait);
                inner.next_wait += 1;
                inner.waits.insert(
                    wait_id,
                    WaitEntry {
                        target: num_replicas,
                        ready,
                        pending,
                        reply: Some(Box::new(reply)),
                        timer: JobHandle::detached(),
                    },
                );
                Outcome::Armed(wait_id, nudges)
            }
        };

        match outcome {
            Outcome::Now(ready, reply) => reply(ready),
            Outcome::Armed(wait_id, nudges) => {
                for outbox in nudges {
                    (outbox.borrow_mut())(&getack);
                }
                let hub = self.clone();
                let timer = self
                    .loop_handle
                    .set_timeout(Duration::from_millis(timeout_ms), move || {
                        hub.expire_wait(wait_id);
                    });
                if let Some(entry) = self.inner.borrow_mut().waits.get_mut(&wait_id) {
                    entry.timer = timer;
                }
            }
        }
    }

    /// Replies to a timed-out WAIT with however many followers made it.
    fn expire_wait(&self, wait_id: WaitId) {
        let resolved = {
            let mut inner = self.inner.borrow_mut();
            inner.waits.remove(&wait_id).map(|entry| ResolvedWait {
                ready: entry.ready as i64,
                reply: entry.reply,
                timer: entry.timer,
            })
        };
        if let Some(wait) = resolved {
            wait.fire();
        }
    }
}
