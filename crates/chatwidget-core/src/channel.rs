//! The page-wide inbound message channel.
//!
//! Host adapters push every `message` event here. Consumers hold a [`Subscription`]; dropping it
//! removes exactly that consumer's listener and nothing else. A subscription may name the one
//! origin it trusts; hosts ask [`MessageChannel::accepts_origin`] before decoding a payload.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub origin: String,
    pub data: Value,
}

impl InboundEvent {
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
        }
    }
}

type ChannelListener = Rc<dyn Fn(&InboundEvent)>;

struct Registered {
    id: u64,
    trusted_origin: Option<String>,
    listener: ChannelListener,
}

impl Registered {
    fn accepts(&self, origin: &str) -> bool {
        self.trusted_origin
            .as_deref()
            .is_none_or(|trusted| trusted == origin)
    }
}

#[derive(Default)]
struct ChannelState {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Registered>>,
}

#[derive(Clone, Default)]
pub struct MessageChannel {
    state: Rc<ChannelState>,
}

impl MessageChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives events from every origin.
    pub fn subscribe(&self, listener: impl Fn(&InboundEvent) + 'static) -> Subscription {
        self.register(None, Rc::new(listener))
    }

    /// Receives only events whose origin equals `origin`.
    pub fn subscribe_from(
        &self,
        origin: impl Into<String>,
        listener: impl Fn(&InboundEvent) + 'static,
    ) -> Subscription {
        self.register(Some(origin.into()), Rc::new(listener))
    }

    fn register(&self, trusted_origin: Option<String>, listener: ChannelListener) -> Subscription {
        let id = self.state.next_id.get() + 1;
        self.state.next_id.set(id);
        self.state.listeners.borrow_mut().push(Registered {
            id,
            trusted_origin,
            listener,
        });
        Subscription {
            id,
            state: Rc::downgrade(&self.state),
        }
    }

    /// Whether any current listener would receive an event from `origin`.
    #[must_use]
    pub fn accepts_origin(&self, origin: &str) -> bool {
        self.state
            .listeners
            .borrow()
            .iter()
            .any(|registered| registered.accepts(origin))
    }

    /// Delivers one event to every accepting listener registered when delivery starts, in
    /// registration order. Listeners may subscribe or unsubscribe while being called.
    pub fn dispatch(&self, event: &InboundEvent) {
        let snapshot = self
            .state
            .listeners
            .borrow()
            .iter()
            .filter(|registered| registered.accepts(&event.origin))
            .map(|registered| (registered.id, Rc::clone(&registered.listener)))
            .collect::<Vec<_>>();
        for (id, listener) in snapshot {
            let still_subscribed = self
                .state
                .listeners
                .borrow()
                .iter()
                .any(|registered| registered.id == id);
            if still_subscribed {
                listener(event);
            }
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.listeners.borrow().len()
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    state: Weak<ChannelState>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state
                .listeners
                .borrow_mut()
                .retain(|registered| registered.id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
