//! Readiness polling over `mio`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::event_loop::{JobHandle, LoopHandle};

/// Abstract readiness kinds, decoupled from the OS bit sets.
///
/// Within one poll tick a single source's distinct kinds are delivered in
/// exactly this declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoEventKind {
    /// The registered descriptor is no longer valid.
    InvalidFd,
    /// The OS flagged an error condition on the descriptor.
    Error,
    /// The peer hung up and nothing is left to read.
    HangUp,
    ReadyToRead,
    ReadyToWrite,
}

type Listener = Rc<RefCell<dyn FnMut(IoEventKind)>>;

struct PollerInner {
    poll: Poll,
    events: Events,
    listeners: HashMap<Token, Listener>,
    next_token: usize,
}

/// Maps registered I/O sources to listener closures and dispatches
/// readiness to them from its place in the event loop's repeat queue.
///
/// Cloning yields another handle to the same poller.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<RefCell<PollerInner>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inner: Rc::new(RefCell::new(PollerInner {
                poll: Poll::new()?,
                events: Events::with_capacity(256),
                listeners: HashMap::new(),
                next_token: 0,
            })),
        })
    }

    /// Registers `source` and its listener, returning the token that
    /// identifies the registration.
    pub fn register(
        &self,
        source: &mut impl Source,
        interest: Interest,
        listener: impl FnMut(IoEventKind) + 'static,
    ) -> io::Result<Token> {
        let mut inner = self.inner.borrow_mut();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        inner.poll.registry().register(source, token, interest)?;
        inner.listeners.insert(token, Rc::new(RefCell::new(listener)));
        trace!(?token, "registered poll source");
        Ok(token)
    }

    /// Replaces the interest set of an existing registration.
    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        let inner = self.inner.borrow();
        inner.poll.registry().reregister(source, token, interest)
    }

    /// Removes a registration. The listener is dropped; readiness already
    /// collected for this token in the current tick is discarded.
    pub fn deregister(&self, source: &mut impl Source, token: Token) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.listeners.remove(&token);
        inner.poll.registry().deregister(source)?;
        trace!(?token, "deregistered poll source");
        Ok(())
    }

    /// Number of live registrations.
    pub fn registered(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// Polls with a zero timeout and dispatches readiness to listeners.
    pub fn poll_once(&self) -> io::Result<()> {
        self.poll(Some(Duration::ZERO))
    }

    /// Polls with the given timeout and dispatches readiness to listeners.
    ///
    /// Listeners run outside any borrow of the poller, so they are free to
    /// register, reregister, or deregister sources — including their own.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
        let ready: Vec<(Token, Vec<IoEventKind>)> = {
            let mut inner = self.inner.borrow_mut();
            // Work around double-borrow of inner: poll writes into a
            // scratch Events moved back afterwards.
            let mut events = std::mem::replace(&mut inner.events, Events::with_capacity(0));
            let result = inner.poll.poll(&mut events, timeout);
            let ready = events
                .iter()
                .map(|event| (event.token(), translate(event)))
                .collect();
            inner.events = events;
            result?;
            ready
        };

        for (token, kinds) in ready {
            let listener = self.inner.borrow().listeners.get(&token).cloned();
            let Some(listener) = listener else {
                warn!(?token, "readiness for token with no listener; dropped");
                continue;
            };
            for kind in kinds {
                // The listener may have deregistered itself on a previous
                // kind; stop delivering the rest if so.
                if !self.inner.borrow().listeners.contains_key(&token) {
                    break;
                }
                (listener.borrow_mut())(kind);
            }
        }
        Ok(())
    }

    /// Installs this poller as a repeating job on the loop.
    ///
    /// The job polls with a minimal (1 ms) timeout rather than zero: when
    /// nothing is ready it doubles as the loop's idle wait instead of
    /// spinning the CPU.
    pub fn attach(&self, handle: &LoopHandle) -> JobHandle {
        let poller = self.clone();
        handle.post_repeating(move || {
            if let Err(e) = poller.poll(Some(Duration::from_millis(1))) {
                warn!(error = %e, "poll failed");
            }
        })
    }
}

/// Translates one mio event into the abstract kind set, in delivery order.
fn translate(event: &mio::event::Event) -> Vec<IoEventKind> {
    let mut kinds = Vec::with_capacity(2);
    if event.is_error() {
        kinds.push(IoEventKind::Error);
    }
    // A peer FIN can arrive with data still queued behind it; deliver the
    // hangup only once there is nothing left to read, so the handler drains
    // the tail and observes the orderly read()==0 close itself.
    if event.is_read_closed() && !event.is_readable() {
        kinds.push(IoEventKind::HangUp);
    }
    if event.is_readable() {
        kinds.push(IoEventKind::ReadyToRead);
    }
    if event.is_writable() {
        kinds.push(IoEventKind::ReadyToWrite);
    }
    kinds
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::SocketAddr;

    use mio::net::{TcpListener, TcpStream};

    use super::*;

    /// Polls until `done` reports true, or panics after ~2 s.
    fn poll_until(poller: &Poller, mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            poller.poll_once().unwrap();
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached under polling");
    }

    fn bound_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn delivers_accept_readiness() {
        let poller = Poller::new().unwrap();
        let (mut listener, addr) = bound_listener();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        poller
            .register(&mut listener, Interest::READABLE, move |kind| {
                sink.borrow_mut().push(kind);
            })
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        poll_until(&poller, || !seen.borrow().is_empty());
        assert_eq!(seen.borrow()[0], IoEventKind::ReadyToRead);
    }

    #[test]
    fn read_precedes_write_for_one_source() {
        let poller = Poller::new().unwrap();
        let (mut listener, addr) = bound_listener();
        poller
            .register(&mut listener, Interest::READABLE, |_| {})
            .unwrap();

        // Connect, accept, and park a byte on the wire before registering
        // the client side, so its first readiness report carries both
        // readable and writable at once.
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        poll_until(&poller, || {
            if accepted.is_none() {
                if let Ok((sock, _)) = listener.accept() {
                    accepted = Some(sock);
                }
            }
            accepted.is_some()
        });
        accepted.as_mut().unwrap().write_all(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        poller
            .register(
                &mut stream,
                Interest::READABLE | Interest::WRITABLE,
                move |kind| sink.borrow_mut().push(kind),
            )
            .unwrap();

        poll_until(&poller, || {
            let kinds = seen.borrow();
            kinds.contains(&IoEventKind::ReadyToRead) && kinds.contains(&IoEventKind::ReadyToWrite)
        });
        let kinds = seen.borrow();
        let read_pos = kinds.iter().position(|k| *k == IoEventKind::ReadyToRead);
        let write_pos = kinds.iter().position(|k| *k == IoEventKind::ReadyToWrite);
        assert!(read_pos < write_pos, "read must be delivered before write");
    }

    #[test]
    fn deregister_stops_delivery_and_bookkeeping() {
        let poller = Poller::new().unwrap();
        let (mut listener, addr) = bound_listener();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let token = poller
            .register(&mut listener, Interest::READABLE, move |kind| {
                sink.borrow_mut().push(kind);
            })
            .unwrap();
        assert_eq!(poller.registered(), 1);

        poller.deregister(&mut listener, token).unwrap();
        assert_eq!(poller.registered(), 0);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..20 {
            poller.poll_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn listener_may_deregister_itself() {
        let poller = Poller::new().unwrap();
        let (listener, addr) = bound_listener();
        let listener = Rc::new(RefCell::new(listener));

        let fired = Rc::new(RefCell::new(0));
        let token_cell: Rc<RefCell<Option<Token>>> = Rc::new(RefCell::new(None));

        let listener_in_closure = Rc::clone(&listener);
        let inner_poller = poller.clone();
        let fired_in_closure = Rc::clone(&fired);
        let cell_in_closure = Rc::clone(&token_cell);
        let token = poller
            .register(&mut *listener.borrow_mut(), Interest::READABLE, move |_| {
                *fired_in_closure.borrow_mut() += 1;
                let token = cell_in_closure.borrow().unwrap();
                inner_poller
                    .deregister(&mut *listener_in_closure.borrow_mut(), token)
                    .unwrap();
            })
            .unwrap();
        *token_cell.borrow_mut() = Some(token);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        poll_until(&poller, || *fired.borrow() > 0);
        assert_eq!(poller.registered(), 0);

        // Further connections produce no callbacks.
        let _client2 = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..20 {
            poller.poll_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*fired.borrow(), 1);
    }
}
