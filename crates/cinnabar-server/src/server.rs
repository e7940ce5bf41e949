//! Server bring-up: bind, accept, and the follower's outbound handshake.

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use mio::Interest;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use cinnabar_reactor::{EventLoop, IoEventKind, LoopHandle, Poller};
use cinnabar_replication::ReplicationHub;
use cinnabar_store::{SharedStore, Store, snapshot};

use crate::config::ServerConfig;
use crate::connection::{ConnectionHandler, Connections};
use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::info::ServerInfo;
use crate::replica_talker::ReplicaTalker;
use crate::server_talker::ServerTalker;
use crate::talker::{Outlet, Talker};

/// Bind attempts before giving up on an in-use address.
const BIND_ATTEMPTS: u32 = 8;
/// Pause between bind attempts.
const BIND_BACKOFF: Duration = Duration::from_millis(250);

/// The assembled server: event loop, poller, storage, replication state,
/// and the connection set.
///
/// On a leader, [`start`](Server::start) binds the client listener. On a
/// follower it additionally opens the outbound connection to the leader
/// and joins the replication handshake.
pub struct Server {
    event_loop: EventLoop,
    poller: Poller,
    ctx: ServerContext,
    connections: Connections,
}

impl Server {
    /// Builds the runtime and loads the startup snapshot, if configured.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let poller = Poller::new()?;
        poller.attach(&handle);

        let mut store = Store::new();
        if let Some(path) = config.snapshot_path() {
            snapshot::read_file(&path, &mut store)?;
        }

        let info = ServerInfo::new(&config);
        let ctx = ServerContext {
            store: SharedStore::new(store, handle.clone()),
            hub: ReplicationHub::new(handle.clone()),
            loop_handle: handle,
            config: Rc::new(config),
            info: Rc::new(info),
            applied_offset: Rc::new(std::cell::Cell::new(0)),
        };

        Ok(Self {
            event_loop,
            poller,
            ctx,
            connections: Connections::new(),
        })
    }

    /// A handle for scheduling onto (or stopping) the server's loop.
    pub fn loop_handle(&self) -> LoopHandle {
        self.ctx.loop_handle.clone()
    }

    /// Shared state, exposed for inspection in tests and tooling.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Binds the listener (and, on a follower, dials the leader). Returns
    /// the bound address.
    pub fn start(&mut self) -> ServerResult<SocketAddr> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.ctx.config.port).into();
        let listener = bind_with_retry(addr)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, role = if self.ctx.config.is_replica() { "slave" } else { "master" }, "listening");

        self.register_acceptor(listener)?;

        if let Some((host, port)) = self.ctx.config.replica_of.clone() {
            self.connect_to_leader(&host, port)?;
        }
        Ok(local_addr)
    }

    /// Runs until the loop is stopped.
    pub fn run(mut self) -> ServerResult<()> {
        self.start()?;
        self.event_loop.run();
        Ok(())
    }

    /// Executes one event-loop tick; drives everything in tests.
    pub fn tick(&mut self) {
        self.event_loop.tick();
    }

    fn register_acceptor(&self, listener: TcpListener) -> ServerResult<()> {
        let listener = Rc::new(RefCell::new(listener));
        let accept_from = Rc::clone(&listener);
        let ctx = self.ctx.clone();
        let poller = self.poller.clone();
        let connections = self.connections.clone();

        self.poller
            .register(&mut *listener.borrow_mut(), Interest::READABLE, move |kind| {
                if kind != IoEventKind::ReadyToRead {
                    warn!(?kind, "listener readiness ignored");
                    return;
                }
                loop {
                    match accept_from.borrow_mut().accept() {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted client");
                            spawn_session(stream, &ctx, &poller, &connections);
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    fn connect_to_leader(&self, host: &str, port: u16) -> ServerResult<()> {
        let leader = format!("{host}:{port}");
        let addr = leader
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ServerError::ResolveLeader(leader.clone()))?;
        info!(%addr, "dialing leader");

        let stream = TcpStream::connect(addr)?;
        let talker = ReplicaTalker::new(self.ctx.clone());
        let connections = self.connections.clone();
        let handler = ConnectionHandler::establish(
            stream,
            Box::new(talker),
            &self.poller,
            Interest::READABLE | Interest::WRITABLE,
            move |token| connections.remove(token),
        )?;
        self.connections
            .insert(handler.borrow().token(), Rc::clone(&handler));

        // Queue the opening PING; it flushes once the connect completes.
        ConnectionHandler::poke(&handler);
        Ok(())
    }
}

/// One accepted client: a server talker wired through its outlet.
fn spawn_session(
    stream: TcpStream,
    ctx: &ServerContext,
    poller: &Poller,
    connections: &Connections,
) {
    let out = Outlet::new(ctx.loop_handle.clone());
    let talker: Box<dyn Talker> = Box::new(ServerTalker::new(ctx.clone(), out.clone()));
    let closer = connections.clone();
    match ConnectionHandler::establish(stream, talker, poller, Interest::READABLE, move |token| {
        closer.remove(token);
    }) {
        Ok(handler) => {
            out.bind(&handler);
            connections.insert(handler.borrow().token(), Rc::clone(&handler));
        }
        Err(e) => warn!(error = %e, "failed to establish session"),
    }
}

/// Binds with `SO_REUSEADDR` (mio sets it), retrying an in-use address.
fn bind_with_retry(addr: SocketAddr) -> ServerResult<TcpListener> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS =>
            {
                warn!(%addr, attempt, "address in use; retrying");
                std::thread::sleep(BIND_BACKOFF);
                attempt += 1;
            }
            Err(source) => return Err(ServerError::BindFailed { addr, source }),
        }
    }
}
