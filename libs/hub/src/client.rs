use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use botgate_core::Principal;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::frames::ServerFrame;

/// Per-client send queue capacity. Overflow marks the client lossy and the
/// hub closes it.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Delivered,
    Full,
    Closed,
}

/// Connection state shared between the hub registry and the client's two
/// tasks. The send queue is the synchronization primitive: closing it (done
/// exactly once) terminates the outbound pump.
pub struct Client {
    id: Uuid,
    principal: Principal,
    chats: Mutex<HashSet<i64>>,
    sender: Mutex<Option<mpsc::Sender<ServerFrame>>>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(principal: Principal) -> (Arc<Self>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                principal,
                chats: Mutex::new(HashSet::new()),
                sender: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn subscribed_to(&self, chat_id: i64) -> bool {
        self.chats
            .lock()
            .map(|set| set.contains(&chat_id))
            .unwrap_or(false)
    }

    /// Returns true if the chat was newly added.
    pub fn add_chat(&self, chat_id: i64) -> bool {
        self.chats
            .lock()
            .map(|mut set| set.insert(chat_id))
            .unwrap_or(false)
    }

    /// Returns true if the chat was present.
    pub fn remove_chat(&self, chat_id: i64) -> bool {
        self.chats
            .lock()
            .map(|mut set| set.remove(&chat_id))
            .unwrap_or(false)
    }

    /// Empties and returns the subscription set; used on unregister to
    /// release broker references.
    pub fn take_chats(&self) -> Vec<i64> {
        self.chats
            .lock()
            .map(|mut set| set.drain().collect())
            .unwrap_or_default()
    }

    pub fn enqueue(&self, frame: ServerFrame) -> Enqueue {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return Enqueue::Closed;
        };
        match sender.try_send(frame) {
            Ok(()) => Enqueue::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Closes the send queue exactly once. The pump observes the closed
    /// channel and exits; the reader follows on transport close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
