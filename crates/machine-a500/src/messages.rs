//! Out-of-band notifications to the front-end.
//!
//! Chips put messages; the host either polls the bounded queue or
//! registers a listener, which is invoked directly from the emulation
//! thread (the queue then only buffers what arrived before registration).
//! A full queue drops the new message and counts the loss.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Config,
    PowerOn,
    PowerOff,
    Run,
    Pause,
    Reset,
    RomMissing,
    ChipRamLimit,
    ArosRamLimit,
    WarpOn,
    WarpOff,
    PowerLedOn,
    PowerLedOff,
    BreakpointReached,
    WatchpointReached,
    MemLayout,
    DriveConnect,
    DriveDisconnect,
    DriveDiskInsert,
    DriveDiskEject,
    DriveMotorOn,
    DriveMotorOff,
    DriveDmaOn,
    DriveDmaOff,
    DriveHead,
    DiskWarning,
    SerIn,
    SerOut,
    AutoSnapshotSaved,
    AutoSnapshotLoaded,
    UserSnapshotSaved,
    UserSnapshotLoaded,
}

/// A message with its optional small payload (typically a drive number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub msg: MsgType,
    pub data: i64,
}

type Listener = Box<dyn Fn(Message) + Send>;

struct Inner {
    queue: VecDeque<Message>,
    capacity: usize,
    dropped: u64,
    listener: Option<Listener>,
}

/// Cheaply clonable handle shared between the machine and the host.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity,
                dropped: 0,
                listener: None,
            })),
        }
    }

    pub fn put(&self, msg: MsgType) {
        self.put_data(msg, 0);
    }

    pub fn put_data(&self, msg: MsgType, data: i64) {
        let message = Message { msg, data };
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(listener) = &inner.listener {
            listener(message);
            return;
        }
        if inner.queue.len() >= inner.capacity {
            inner.dropped += 1;
            return;
        }
        inner.queue.push_back(message);
    }

    /// Poll the next message, if any.
    pub fn get(&self) -> Option<Message> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.queue.pop_front()
    }

    /// Register a callback; buffered messages are replayed to it first.
    pub fn set_listener(&self, listener: impl Fn(Message) + Send + 'static) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(message) = inner.queue.pop_front() {
            listener(message);
        }
        inner.listener = Some(Box::new(listener));
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        match self.inner.lock() {
            Ok(guard) => guard.dropped,
            Err(poisoned) => poisoned.into_inner().dropped,
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn queue_delivers_in_order() {
        let q = MessageQueue::new();
        q.put(MsgType::PowerOn);
        q.put_data(MsgType::DriveMotorOn, 2);
        assert_eq!(q.get().unwrap().msg, MsgType::PowerOn);
        let m = q.get().unwrap();
        assert_eq!(m.msg, MsgType::DriveMotorOn);
        assert_eq!(m.data, 2);
        assert!(q.get().is_none());
    }

    #[test]
    fn full_queue_drops_new_messages() {
        let q = MessageQueue::with_capacity(2);
        q.put(MsgType::Run);
        q.put(MsgType::Pause);
        q.put(MsgType::Reset);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.get().unwrap().msg, MsgType::Run);
    }

    #[test]
    fn listener_receives_backlog_and_new() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let q = MessageQueue::new();
        q.put(MsgType::PowerOn);
        q.set_listener(|_| {
            SEEN.fetch_add(1, Ordering::SeqCst);
        });
        q.put(MsgType::Run);
        assert_eq!(SEEN.load(Ordering::SeqCst), 2);
        assert!(q.get().is_none());
    }
}
