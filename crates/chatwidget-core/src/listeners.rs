use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use serde_json::Value;

use crate::protocol::MessageType;

pub type Listener = Rc<dyn Fn(&Value) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

/// Per-instance subscriber lists keyed by message type.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: Cell<u64>,
    entries: RefCell<BTreeMap<MessageType, Vec<ListenerEntry>>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, message_type: MessageType, callback: Listener) -> ListenerId {
        self.insert(message_type, callback, false)
    }

    pub fn once(&self, message_type: MessageType, callback: Listener) -> ListenerId {
        self.insert(message_type, callback, true)
    }

    pub fn off(&self, message_type: MessageType, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let Some(list) = entries.get_mut(&message_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(&message_type);
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Whether `id` is still registered for `message_type`. A `once` listener stops being
    /// registered as soon as it is emitted.
    #[must_use]
    pub fn contains(&self, message_type: MessageType, id: ListenerId) -> bool {
        self.entries
            .borrow()
            .get(&message_type)
            .is_some_and(|list| list.iter().any(|entry| entry.id == id))
    }

    #[must_use]
    pub fn count(&self, message_type: MessageType) -> usize {
        self.entries
            .borrow()
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Calls every subscriber of `message_type` in registration order. A subscriber that returns
    /// an error or panics is logged and skipped; the rest still run. Returns how many succeeded.
    pub fn emit(&self, message_type: MessageType, payload: &Value) -> usize {
        let callbacks = {
            let mut entries = self.entries.borrow_mut();
            let Some(list) = entries.get_mut(&message_type) else {
                return 0;
            };
            let callbacks = list
                .iter()
                .map(|entry| (entry.id, Rc::clone(&entry.callback)))
                .collect::<Vec<_>>();
            list.retain(|entry| !entry.once);
            if list.is_empty() {
                entries.remove(&message_type);
            }
            callbacks
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(error)) => {
                    tracing::warn!(
                        message_type = %message_type,
                        listener = id.0,
                        error = %error,
                        "Widget event listener failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        message_type = %message_type,
                        listener = id.0,
                        "Widget event listener panicked"
                    );
                }
            }
        }
        delivered
    }

    fn insert(&self, message_type: MessageType, callback: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.get() + 1);
        self.next_id.set(id.0);
        self.entries
            .borrow_mut()
            .entry(message_type)
            .or_default()
            .push(ListenerEntry { id, once, callback });
        id
    }
}
