//! Shared per-process state handed to every session.

use std::cell::Cell;
use std::rc::Rc;

use cinnabar_reactor::LoopHandle;
use cinnabar_replication::ReplicationHub;
use cinnabar_store::SharedStore;

use crate::config::ServerConfig;
use crate::info::ServerInfo;

/// Everything a session needs to execute commands: storage, the replica
/// hub, the scheduler, and the node's static configuration and identity.
///
/// Cheap to clone; all members are shared handles.
#[derive(Clone)]
pub struct ServerContext {
    pub store: SharedStore,
    pub hub: ReplicationHub,
    pub loop_handle: LoopHandle,
    pub config: Rc<ServerConfig>,
    pub info: Rc<ServerInfo>,
    /// On a follower, the apply-loop's cumulative received bytes; mirrors
    /// what `REPLCONF ACK` reports. Unused on a leader.
    pub applied_offset: Rc<Cell<u64>>,
}

impl ServerContext {
    /// The replication offset `INFO` reports for this node's role.
    pub fn replication_offset(&self) -> u64 {
        if self.config.is_replica() {
            self.applied_offset.get()
        } else {
            self.hub.master_offset()
        }
    }
}
