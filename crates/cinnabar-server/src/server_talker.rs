//! The leader-side session state machine.
//!
//! A server talker is a request/response engine with three side effects:
//! it registers its connection as a follower on the first `REPLCONF`, it
//! ships the full-resync snapshot on `PSYNC` and promotes the follower to
//! the write stream, and it deregisters the follower when the connection
//! is interrupted.
//!
//! `WAIT` and blocking `XREAD` reply out-of-band. While such a reply is
//! outstanding the session is *blocked*: frames that arrive in the
//! meantime are backlogged and processed, in order, once the reply lands.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, warn};

use cinnabar_store::{snapshot, StoreError, StreamEntry, StreamReadResult};
use cinnabar_types::{InputStreamId, ReplicaId, StreamWaiterId};
use cinnabar_wire::{Command, CommandError, DecodedFrame, Frame};

use crate::context::ServerContext;
use crate::talker::{Outlet, Talker};

pub struct ServerTalker {
    ctx: ServerContext,
    out: Outlet,
    /// Frames received while an out-of-band reply is outstanding.
    backlog: VecDeque<DecodedFrame>,
    /// Shared with reply slots; true while a reply is outstanding.
    waiting: Rc<Cell<bool>>,
    /// Set once this connection introduced itself as a follower.
    replica_id: Option<ReplicaId>,
    /// The parked read to cancel if the connection goes away blocked.
    blocked_read: Option<StreamWaiterId>,
}

impl ServerTalker {
    pub fn new(ctx: ServerContext, out: Outlet) -> Self {
        Self {
            ctx,
            out,
            backlog: VecDeque::new(),
            waiting: Rc::new(Cell::new(false)),
            replica_id: None,
            blocked_read: None,
        }
    }

    fn process(&mut self, frame: &DecodedFrame) {
        match Command::parse(&frame.frame) {
            Ok(command) => self.execute(command),
            Err(e) => self.out.push(Frame::error(e.to_string())),
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Ping => self.out.push(Frame::simple("PONG")),

            Command::Echo { payload } => self.out.push(Frame::bulk(payload)),

            Command::Set { .. } if self.ctx.config.is_replica() => {
                self.out
                    .push(Frame::error("ERR You can't write against a read only replica."));
            }
            Command::Set {
                ref key,
                ref value,
                expire_ms,
            } => {
                self.ctx.store.set(key.clone(), value.clone(), expire_ms);
                self.ctx.hub.propagate(&command);
                self.out.push(Frame::simple("OK"));
            }

            Command::Get { key } => match self.ctx.store.get(&key) {
                Some(data) => self.out.push(Frame::bulk(data)),
                None => self.out.push(Frame::null_bulk()),
            },

            Command::Type { key } => {
                self.out
                    .push(Frame::simple(self.ctx.store.kind(&key).to_string()));
            }

            Command::Keys { pattern: _ } => {
                let keys = self
                    .ctx
                    .store
                    .keys()
                    .into_iter()
                    .map(Frame::bulk_text)
                    .collect();
                self.out.push(Frame::array(keys));
            }

            Command::ConfigGet { key } => match self.ctx.config.config_value(&key) {
                Some(value) => self.out.push(Frame::array(vec![
                    Frame::bulk_text(key),
                    Frame::bulk_text(value),
                ])),
                None => self.out.push(Frame::array(Vec::new())),
            },

            Command::Info { sections } => {
                let body = self
                    .ctx
                    .info
                    .render(&sections, self.ctx.replication_offset());
                self.out.push(Frame::bulk(Bytes::from(body)));
            }

            Command::ReplConf { args } => self.handle_replconf(&args),

            Command::Psync { .. } => self.handle_psync(),

            Command::Wait {
                num_replicas,
                timeout_ms,
            } => self.handle_wait(num_replicas, timeout_ms),

            Command::XAdd { key, id, fields } => match self.ctx.store.xadd(&key, id, fields.clone())
            {
                Ok(allocated) => {
                    // Followers get the resolved ID: a wildcard re-run on
                    // their side would allocate differently.
                    self.ctx.hub.propagate(&Command::XAdd {
                        key,
                        id: InputStreamId::Exact(allocated),
                        fields,
                    });
                    self.out.push(Frame::bulk_text(allocated.to_string()));
                }
                Err(e) => self.out.push(store_error_frame(&e)),
            },

            Command::XRange { key, start, end } => {
                match self.ctx.store.xrange(&key, start, end) {
                    Ok(entries) => self.out.push(entries_frame(&entries)),
                    Err(e) => self.out.push(store_error_frame(&e)),
                }
            }

            Command::XRead { requests, block_ms } => self.handle_xread(&requests, block_ms),
        }
    }

    /// First `REPLCONF` registers the follower. `listening-port` and
    /// `capa` are acknowledged; an `ACK` updates the registry silently.
    fn handle_replconf(&mut self, args: &[String]) {
        let replica_id = *self.replica_id.get_or_insert_with(|| {
            let outlet = self.out.clone();
            self.ctx.hub.register(move |frame| outlet.deliver(frame.clone()))
        });

        let sub = args.first().map(|s| s.to_ascii_lowercase());
        match sub.as_deref() {
            Some("listening-port") => {
                if args.len() != 2 {
                    warn!(?args, "odd REPLCONF listening-port arity");
                }
                self.out.push(Frame::simple("OK"));
            }
            Some("ack") => match args.get(1).and_then(|n| n.parse::<u64>().ok()) {
                Some(bytes) => self.ctx.hub.ack(replica_id, bytes),
                None => warn!(?args, "unparsable REPLCONF ACK"),
            },
            _ => self.out.push(Frame::simple("OK")),
        }
    }

    /// Replies `+FULLRESYNC`, queues the snapshot payload, and promotes
    /// the follower onto the write stream.
    fn handle_psync(&mut self) {
        let replica_id = *self.replica_id.get_or_insert_with(|| {
            let outlet = self.out.clone();
            self.ctx.hub.register(move |frame| outlet.deliver(frame.clone()))
        });

        let header = format!(
            "FULLRESYNC {} {}",
            self.ctx.info.master_replid,
            self.ctx.hub.master_offset()
        );
        self.out.push(Frame::simple(header));
        self.ctx.hub.mark_resync(replica_id);
        self.out
            .push(Frame::BulkPayload(snapshot::empty_snapshot()));
        self.ctx.hub.mark_write(replica_id);
        debug!(replica = %replica_id, "full resync queued");
    }

    fn handle_wait(&mut self, num_replicas: u64, timeout_ms: u64) {
        let outlet = self.out.clone();
        let waiting = Rc::clone(&self.waiting);
        waiting.set(true);
        self.ctx.hub.wait(num_replicas, timeout_ms, move |count| {
            waiting.set(false);
            outlet.deliver(Frame::Integer(count));
        });
    }

    fn handle_xread(
        &mut self,
        requests: &[(String, cinnabar_types::ReadStreamId)],
        block_ms: Option<u64>,
    ) {
        let outlet = self.out.clone();
        let waiting = Rc::clone(&self.waiting);
        waiting.set(true);
        self.blocked_read = self.ctx.store.xread(requests, block_ms, move |results| {
            waiting.set(false);
            outlet.deliver(xread_frame(&results));
        });
    }
}

impl Talker for ServerTalker {
    fn listen(&mut self, frame: DecodedFrame) {
        if self.waiting.get() {
            self.backlog.push_back(frame);
        } else {
            self.process(&frame);
        }
    }

    fn say(&mut self) -> Option<Frame> {
        self.out.pop()
    }

    fn resume(&mut self) {
        while !self.waiting.get() {
            let Some(frame) = self.backlog.pop_front() else {
                break;
            };
            self.process(&frame);
        }
    }

    fn interrupt(&mut self) {
        if let Some(id) = self.replica_id.take() {
            self.ctx.hub.remove(id);
        }
        if let Some(waiter) = self.blocked_read.take() {
            self.ctx.store.cancel_waiter(waiter);
        }
    }
}

fn store_error_frame(e: &StoreError) -> Frame {
    Frame::error(format!("{} {e}", e.code()))
}

/// `[[id, [f1, v1, …]], …]`
fn entries_frame(entries: &[StreamEntry]) -> Frame {
    Frame::array(entries.iter().map(entry_frame).collect())
}

fn entry_frame((id, pairs): &StreamEntry) -> Frame {
    let mut flat = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        flat.push(Frame::bulk(field.clone()));
        flat.push(Frame::bulk(value.clone()));
    }
    Frame::array(vec![Frame::bulk_text(id.to_string()), Frame::array(flat)])
}

/// `[[key, entries], …]`, or the null array when nothing came back.
fn xread_frame(results: &[StreamReadResult]) -> Frame {
    if results.is_empty() {
        return Frame::null_array();
    }
    Frame::array(
        results
            .iter()
            .map(|result| {
                Frame::array(vec![
                    Frame::bulk_text(result.key.clone()),
                    entries_frame(&result.entries),
                ])
            })
            .collect(),
    )
}
