//! The follower-side handshake and apply-loop state machine.
//!
//! A linear conversation driven by the leader's responses:
//!
//! ```text
//! (start)        send PING                                  -> WaitPong
//! WaitPong       +PONG  -> send REPLCONF listening-port <p> -> WaitOkPort
//! WaitOkPort     +OK    -> send REPLCONF capa psync2        -> WaitOkCapa
//! WaitOkCapa     +OK    -> send PSYNC ? -1                  -> WaitFullResync
//! WaitFullResync +FULLRESYNC ...                            -> WaitSnapshot
//! WaitSnapshot   <snapshot payload>                         -> Applying
//! Applying       apply writes; REPLCONF GETACK * -> REPLCONF ACK <bytes>
//! ```
//!
//! Any deviation from the expected reply in a handshake state gives up on
//! the connection. In `Applying`, the wire length of every received frame
//! accrues to the replication offset — including the `GETACK` frame
//! itself, before the `ACK` it provokes is built.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use cinnabar_store::snapshot;
use cinnabar_wire::{Command, DecodedFrame, Frame, FrameDiscipline};

use crate::context::ServerContext;
use crate::talker::Talker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    WaitPong,
    WaitOkPort,
    WaitOkCapa,
    WaitFullResync,
    WaitSnapshot,
    Applying,
}

pub struct ReplicaTalker {
    ctx: ServerContext,
    out: VecDeque<Frame>,
    state: HandshakeState,
    /// Wire bytes received since entering `Applying`: the replication
    /// offset reported back in `REPLCONF ACK`.
    bytes_in: u64,
    leave: bool,
}

impl ReplicaTalker {
    pub fn new(ctx: ServerContext) -> Self {
        let mut out = VecDeque::new();
        out.push_back(Command::Ping.to_frame());
        Self {
            ctx,
            out,
            state: HandshakeState::WaitPong,
            bytes_in: 0,
            leave: false,
        }
    }

    fn send(&mut self, command: &Command) {
        self.out.push_back(command.to_frame());
    }

    fn bail(&mut self, state: HandshakeState, got: &Frame) {
        warn!(?state, ?got, "unexpected reply during handshake");
        self.leave = true;
    }

    fn is_ok(frame: &Frame) -> bool {
        matches!(frame, Frame::SimpleString(s) if s == "OK")
    }

    fn apply(&mut self, frame: &Frame) {
        match Command::parse(frame) {
            Ok(Command::ReplConf { args })
                if args
                    .first()
                    .is_some_and(|a| a.eq_ignore_ascii_case("GETACK")) =>
            {
                let ack = Command::ReplConf {
                    args: vec!["ACK".to_owned(), self.bytes_in.to_string()],
                };
                self.send(&ack);
            }
            Ok(Command::Set {
                key,
                value,
                expire_ms,
            }) => {
                self.ctx.store.set(key, value, expire_ms);
            }
            Ok(Command::XAdd { key, id, fields }) => {
                if let Err(e) = self.ctx.store.xadd(&key, id, fields) {
                    warn!(%key, error = %e, "replicated append rejected");
                }
            }
            Ok(Command::Ping) => {}
            Ok(other) => debug!(?other, "ignoring non-write on replication stream"),
            Err(e) => warn!(error = %e, "unparsable frame on replication stream"),
        }
    }
}

impl Talker for ReplicaTalker {
    fn listen(&mut self, decoded: DecodedFrame) {
        let frame = decoded.frame;
        match self.state {
            HandshakeState::WaitPong => {
                if matches!(&frame, Frame::SimpleString(s) if s == "PONG") {
                    let port = self.ctx.config.port;
                    self.send(&Command::ReplConf {
                        args: vec!["listening-port".to_owned(), port.to_string()],
                    });
                    self.state = HandshakeState::WaitOkPort;
                } else {
                    self.bail(self.state, &frame);
                }
            }
            HandshakeState::WaitOkPort => {
                if Self::is_ok(&frame) {
                    self.send(&Command::ReplConf {
                        args: vec!["capa".to_owned(), "psync2".to_owned()],
                    });
                    self.state = HandshakeState::WaitOkCapa;
                } else {
                    self.bail(self.state, &frame);
                }
            }
            HandshakeState::WaitOkCapa => {
                if Self::is_ok(&frame) {
                    self.send(&Command::Psync {
                        replica_id: "?".to_owned(),
                        offset: -1,
                    });
                    self.state = HandshakeState::WaitFullResync;
                } else {
                    self.bail(self.state, &frame);
                }
            }
            HandshakeState::WaitFullResync => {
                if matches!(&frame, Frame::SimpleString(s) if s.starts_with("FULLRESYNC")) {
                    debug!(header = ?frame, "full resync granted");
                    self.state = HandshakeState::WaitSnapshot;
                } else {
                    self.bail(self.state, &frame);
                }
            }
            HandshakeState::WaitSnapshot => {
                if let Frame::BulkPayload(blob) = &frame {
                    let loaded = self
                        .ctx
                        .store
                        .with(|store| snapshot::read_bytes(blob, store));
                    match loaded {
                        Ok(restored) => info!(restored, "snapshot ingested; applying stream"),
                        Err(e) => warn!(error = %e, "snapshot rejected; applying stream anyway"),
                    }
                    self.state = HandshakeState::Applying;
                    self.bytes_in = 0;
                } else {
                    self.bail(self.state, &frame);
                }
            }
            HandshakeState::Applying => {
                self.bytes_in += decoded.wire_len as u64;
                self.ctx.applied_offset.set(self.bytes_in);
                self.apply(&frame);
            }
        }
    }

    fn say(&mut self) -> Option<Frame> {
        if let Some(frame) = self.out.pop_front() {
            return Some(frame);
        }
        if self.leave {
            self.leave = false;
            return Some(Frame::Leave);
        }
        None
    }

    fn expected(&self) -> FrameDiscipline {
        if self.state == HandshakeState::WaitSnapshot {
            FrameDiscipline::SnapshotPayload
        } else {
            FrameDiscipline::Normal
        }
    }
}
