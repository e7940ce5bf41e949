//! Connection state management.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::rc::Rc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use cinnabar_reactor::{IoEventKind, Poller};
use cinnabar_wire::Frame;

use crate::talker::Talker;

/// Bytes drained from the socket per read call.
const READ_CHUNK: usize = 1024;

/// State of one connection: its non-blocking stream, the inbound and
/// outbound byte buffers, and the talker driving the conversation.
///
/// # Teardown
///
/// Whatever ends a connection — peer close, reset, fatal error, or a
/// `Leave` from the talker — the handler deregisters from the poller
/// exactly once, interrupts the talker exactly once, and notifies its
/// owner exactly once.
pub struct ConnectionHandler {
    stream: TcpStream,
    token: Token,
    read_buf: BytesMut,
    write_buf: BytesMut,
    talker: Box<dyn Talker>,
    poller: Poller,
    interest: Interest,
    /// Leave received: flush remaining output, then close.
    closing: bool,
    closed: bool,
    on_close: Option<Box<dyn FnOnce(Token)>>,
}

impl ConnectionHandler {
    /// Registers `stream` with the poller and wires readiness dispatch to
    /// a new handler.
    pub fn establish(
        stream: TcpStream,
        talker: Box<dyn Talker>,
        poller: &Poller,
        interest: Interest,
        on_close: impl FnOnce(Token) + 'static,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let handler = Rc::new(RefCell::new(Self {
            stream,
            token: Token(usize::MAX),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            talker,
            poller: poller.clone(),
            interest,
            closing: false,
            closed: false,
            on_close: Some(Box::new(on_close)),
        }));

        let token = {
            let weak = Rc::downgrade(&handler);
            let mut inner = handler.borrow_mut();
            let Self { stream, .. } = &mut *inner;
            poller.register(stream, interest, move |kind| {
                if let Some(handler) = weak.upgrade() {
                    Self::dispatch(&handler, kind);
                }
            })?
        };
        handler.borrow_mut().token = token;
        Ok(handler)
    }

    /// The poll token identifying this connection.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The poller-facing entry point.
    pub fn dispatch(handler: &Rc<RefCell<Self>>, kind: IoEventKind) {
        let mut this = handler.borrow_mut();
        if this.closed {
            return;
        }
        match kind {
            IoEventKind::InvalidFd | IoEventKind::Error | IoEventKind::HangUp => {
                debug!(token = ?this.token, ?kind, "connection terminated by poller");
                this.teardown();
            }
            IoEventKind::ReadyToRead => this.on_readable(),
            IoEventKind::ReadyToWrite => this.on_writable(),
        }
    }

    /// Pumps and flushes outside poller dispatch, after out-of-band output
    /// landed in the talker's outlet.
    pub fn poke(handler: &Rc<RefCell<Self>>) {
        let mut this = handler.borrow_mut();
        if this.closed {
            return;
        }
        this.talker.resume();
        this.pump();
        this.flush();
        this.update_interest();
    }

    fn on_readable(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // Orderly close from the peer.
                    trace!(token = ?self.token, "peer closed");
                    self.teardown();
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(token = ?self.token, error = %e, "read failed");
                    self.teardown();
                    return;
                }
            }
        }

        self.process_input();
        if self.closed {
            return;
        }
        self.pump();
        self.flush();
        self.update_interest();
    }

    fn on_writable(&mut self) {
        self.flush();
        if self.closed {
            return;
        }
        self.pump();
        self.flush();
        self.update_interest();
    }

    /// Extracts whole frames from the inbound buffer and feeds the talker,
    /// re-asking for the expected discipline before every frame.
    fn process_input(&mut self) {
        loop {
            match Frame::decode(&mut self.read_buf, self.talker.expected()) {
                Ok(Some(decoded)) => self.talker.listen(decoded),
                Ok(None) => return,
                Err(e) => {
                    warn!(token = ?self.token, error = %e, "malformed input; closing");
                    self.teardown();
                    return;
                }
            }
        }
    }

    /// Drains the talker into the write buffer until it has nothing more
    /// to say. `Leave` switches the connection to drain-then-close.
    fn pump(&mut self) {
        while let Some(frame) = self.talker.say() {
            if matches!(frame, Frame::Leave) {
                trace!(token = ?self.token, "talker leaves");
                self.closing = true;
                break;
            }
            frame.encode(&mut self.write_buf);
        }
    }

    /// Writes buffered output until done or the socket pushes back.
    fn flush(&mut self) {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    debug!(token = ?self.token, "zero-length write");
                    self.teardown();
                    return;
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                // An outbound connect still in flight; the poller will
                // report writability once it completes.
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => break,
                Err(e) => {
                    debug!(token = ?self.token, error = %e, "write failed");
                    self.teardown();
                    return;
                }
            }
        }

        if self.closing && self.write_buf.is_empty() {
            self.teardown();
        }
    }

    /// Requests write-readiness only while output is pending.
    fn update_interest(&mut self) {
        if self.closed {
            return;
        }
        let desired = if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if desired == self.interest {
            return;
        }
        let token = self.token;
        if let Err(e) = self.poller.reregister(&mut self.stream, token, desired) {
            warn!(token = ?token, error = %e, "reregister failed");
            self.teardown();
            return;
        }
        self.interest = desired;
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let token = self.token;
        if let Err(e) = self.poller.deregister(&mut self.stream, token) {
            debug!(token = ?token, error = %e, "deregister failed");
        }
        self.talker.interrupt();
        if let Some(on_close) = self.on_close.take() {
            on_close(token);
        }
        debug!(token = ?token, "connection closed");
    }
}

/// The set of live connections, keyed by poll token.
#[derive(Clone, Default)]
pub struct Connections {
    map: Rc<RefCell<HashMap<Token, Rc<RefCell<ConnectionHandler>>>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: Token, handler: Rc<RefCell<ConnectionHandler>>) {
        self.map.borrow_mut().insert(token, handler);
    }

    pub fn remove(&self, token: Token) {
        self.map.borrow_mut().remove(&token);
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use cinnabar_wire::{DecodedFrame, FrameDiscipline};
    use mio::net::TcpListener;

    use super::*;

    /// Echoes every bulk string back; any other frame asks to leave.
    struct EchoTalker {
        pending: Vec<Frame>,
        interrupted: Rc<RefCell<u32>>,
    }

    impl Talker for EchoTalker {
        fn listen(&mut self, frame: DecodedFrame) {
            match frame.frame {
                Frame::BulkString(Some(data)) => self.pending.push(Frame::bulk(data)),
                _ => self.pending.push(Frame::Leave),
            }
        }

        fn say(&mut self) -> Option<Frame> {
            if self.pending.is_empty() {
                None
            } else {
                Some(self.pending.remove(0))
            }
        }

        fn expected(&self) -> FrameDiscipline {
            FrameDiscipline::Normal
        }

        fn interrupt(&mut self) {
            *self.interrupted.borrow_mut() += 1;
        }
    }

    struct Harness {
        poller: Poller,
        client: std::net::TcpStream,
        connections: Connections,
        interrupted: Rc<RefCell<u32>>,
    }

    fn establish_echo_pair() -> Harness {
        let poller = Poller::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();

        let accepted = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let interrupted = Rc::new(RefCell::new(0));
        let talker = EchoTalker {
            pending: Vec::new(),
            interrupted: Rc::clone(&interrupted),
        };
        let connections = Connections::new();
        let closer = connections.clone();
        let handler = ConnectionHandler::establish(
            accepted,
            Box::new(talker),
            &poller,
            Interest::READABLE,
            move |token| closer.remove(token),
        )
        .unwrap();
        connections.insert(handler.borrow().token, Rc::clone(&handler));

        Harness {
            poller,
            client,
            connections,
            interrupted,
        }
    }

    fn read_available(client: &mut std::net::TcpStream, poller: &Poller, want: usize) -> Vec<u8> {
        let mut got = Vec::new();
        for _ in 0..2000 {
            poller.poll_once().unwrap();
            let mut chunk = [0u8; 256];
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client read failed: {e}"),
            }
            if got.len() >= want {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        got
    }

    #[test]
    fn frames_flow_through_the_talker_and_back() {
        let mut h = establish_echo_pair();
        h.client.write_all(b"$2\r\nhi\r\n$3\r\nyou\r\n").unwrap();

        let got = read_available(&mut h.client, &h.poller, 17);
        assert_eq!(got, b"$2\r\nhi\r\n$3\r\nyou\r\n");
        assert_eq!(h.connections.len(), 1);
    }

    #[test]
    fn split_frames_are_reassembled_across_reads() {
        let mut h = establish_echo_pair();
        h.client.write_all(b"$5\r\nhel").unwrap();
        for _ in 0..10 {
            h.poller.poll_once().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        h.client.write_all(b"lo\r\n").unwrap();

        let got = read_available(&mut h.client, &h.poller, 11);
        assert_eq!(got, b"$5\r\nhello\r\n");
    }

    #[test]
    fn peer_close_tears_down_exactly_once() {
        let h = establish_echo_pair();
        assert_eq!(h.poller.registered(), 1);

        drop(h.client);
        for _ in 0..200 {
            h.poller.poll_once().unwrap();
            if h.connections.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.connections.is_empty());
        assert_eq!(h.poller.registered(), 0);
        assert_eq!(*h.interrupted.borrow(), 1);
    }

    #[test]
    fn malformed_input_closes_the_connection() {
        let mut h = establish_echo_pair();
        h.client.write_all(b"!bogus\r\n").unwrap();

        for _ in 0..200 {
            h.poller.poll_once().unwrap();
            if h.connections.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.connections.is_empty());
        assert_eq!(*h.interrupted.borrow(), 1);

        // The peer observes an orderly close.
        let mut buf = [0u8; 16];
        let end = loop {
            match h.client.read(&mut buf) {
                Ok(0) => break true,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break true,
            }
        };
        assert!(end);
    }

    #[test]
    fn leave_drains_pending_output_before_closing() {
        let mut h = establish_echo_pair();
        // One echoable frame, then one that makes the talker leave.
        h.client.write_all(b"$3\r\nbye\r\n:1\r\n").unwrap();

        let got = read_available(&mut h.client, &h.poller, 9);
        assert_eq!(got, b"$3\r\nbye\r\n");

        for _ in 0..200 {
            h.poller.poll_once().unwrap();
            if h.connections.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(h.connections.is_empty());

        let mut buf = [0u8; 16];
        let closed = loop {
            match h.client.read(&mut buf) {
                Ok(0) => break true,
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break true,
            }
        };
        assert!(closed);
    }

    #[test]
    fn poke_pushes_outlet_frames_without_readiness() {
        // A talker whose output arrives out-of-band, as replication
        // fan-out does it.
        struct SilentTalker {
            queued: Rc<RefCell<Vec<Frame>>>,
        }
        impl Talker for SilentTalker {
            fn listen(&mut self, _frame: DecodedFrame) {}
            fn say(&mut self) -> Option<Frame> {
                let mut queued = self.queued.borrow_mut();
                if queued.is_empty() {
                    None
                } else {
                    Some(queued.remove(0))
                }
            }
        }

        let poller = Poller::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let accepted = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };

        let queued = Rc::new(RefCell::new(Vec::new()));
        let handler = ConnectionHandler::establish(
            accepted,
            Box::new(SilentTalker {
                queued: Rc::clone(&queued),
            }),
            &poller,
            Interest::READABLE,
            |_| {},
        )
        .unwrap();

        queued
            .borrow_mut()
            .push(Frame::bulk(Bytes::from_static(b"pushed")));
        ConnectionHandler::poke(&handler);

        let got = read_available(&mut client, &poller, 12);
        assert_eq!(got, b"$6\r\npushed\r\n");
    }
}
