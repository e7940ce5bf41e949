//! The per-connection conversation contract.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use cinnabar_reactor::LoopHandle;
use cinnabar_wire::{DecodedFrame, Frame, FrameDiscipline};

use crate::connection::ConnectionHandler;

/// A per-connection state machine: consumes decoded frames, produces
/// frames to send.
///
/// The connection handler feeds every decoded frame to [`listen`], then
/// drains [`say`] until it yields nothing. A [`Frame::Leave`] from `say`
/// asks the handler to flush remaining output and close.
///
/// [`listen`]: Talker::listen
/// [`say`]: Talker::say
pub trait Talker {
    fn listen(&mut self, frame: DecodedFrame);

    fn say(&mut self) -> Option<Frame>;

    /// The framing the decoder should apply to the next inbound frame.
    fn expected(&self) -> FrameDiscipline {
        FrameDiscipline::Normal
    }

    /// Called exactly once when the connection tears down.
    fn interrupt(&mut self) {}

    /// Called when an out-of-band reply has been delivered to the outlet,
    /// giving the talker a chance to resume buffered input.
    fn resume(&mut self) {}
}

/// The talker's pending-output slot, shareable with code that produces
/// replies out-of-band (timers, replication fan-out, storage wakeups).
///
/// [`push`](Outlet::push) just queues; [`deliver`](Outlet::deliver) queues
/// and schedules a pump of the owning connection on the loop, for callers
/// running outside the handler's own dispatch.
#[derive(Clone)]
pub struct Outlet {
    queue: Rc<RefCell<VecDeque<Frame>>>,
    handler: Rc<RefCell<Weak<RefCell<ConnectionHandler>>>>,
    loop_handle: LoopHandle,
}

impl Outlet {
    pub fn new(loop_handle: LoopHandle) -> Self {
        Self {
            queue: Rc::new(RefCell::new(VecDeque::new())),
            handler: Rc::new(RefCell::new(Weak::new())),
            loop_handle,
        }
    }

    /// Binds the outlet to its connection once the handler exists.
    pub fn bind(&self, handler: &Rc<RefCell<ConnectionHandler>>) {
        *self.handler.borrow_mut() = Rc::downgrade(handler);
    }

    /// Queues a frame. The handler will pick it up on its own dispatch.
    pub fn push(&self, frame: Frame) {
        self.queue.borrow_mut().push_back(frame);
    }

    /// Queues a frame and schedules the owning connection to pump it out.
    pub fn deliver(&self, frame: Frame) {
        self.push(frame);
        self.schedule_pump();
    }

    /// Schedules a pump of the owning connection on the loop's internal
    /// event queue, whose per-tick quota keeps bursts of reactive work
    /// from starving timers and once-jobs.
    pub fn schedule_pump(&self) {
        let handler = self.handler.borrow().clone();
        self.loop_handle.defer(move || {
            if let Some(handler) = handler.upgrade() {
                ConnectionHandler::poke(&handler);
            }
        });
    }

    /// Takes the next queued frame.
    pub fn pop(&self) -> Option<Frame> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
