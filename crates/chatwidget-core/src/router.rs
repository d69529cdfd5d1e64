//! Inbound routing for one widget instance.
//!
//! The origin check runs before anything else looks at the event. Only after it passes is the
//! payload decoded, handed to built-in bookkeeping and then fanned out to subscribers.

use std::rc::Weak;

use crate::channel::{InboundEvent, MessageChannel, Subscription};
use crate::listeners::ListenerRegistry;
use crate::protocol::{AuthHandshake, Envelope, FrameMessage, InboundMessage, MessageType};

/// What the router needs from the instance it serves.
pub trait RouteTarget {
    fn listeners(&self) -> &ListenerRegistry;
    /// Called for every well-formed envelope from the trusted origin.
    fn record_inbound(&self);
    /// Built-in handling for frame→host system messages. Runs before subscribers are notified.
    fn apply_frame_message(&self, message: &FrameMessage);
}

/// Subscribes `target` to `channel`, accepting only events whose origin equals `expected_origin`.
///
/// The subscription holds a weak reference, so it never keeps the instance alive.
pub fn install<T: RouteTarget + 'static>(
    channel: &MessageChannel,
    expected_origin: String,
    target: Weak<T>,
) -> Subscription {
    channel.subscribe_from(expected_origin.clone(), move |event| {
        if let Some(target) = target.upgrade() {
            route(&expected_origin, event, &*target);
        }
    })
}

/// Routes a single event. Returns the message type that reached subscribers, if any.
pub fn route<T: RouteTarget + ?Sized>(
    expected_origin: &str,
    event: &InboundEvent,
    target: &T,
) -> Option<MessageType> {
    if event.origin != expected_origin {
        tracing::debug!(origin = %event.origin, "Dropping message from untrusted origin");
        return None;
    }

    let envelope = match Envelope::decode(&event.data) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(error = %error, "Dropping malformed widget message");
            return None;
        }
    };
    target.record_inbound();

    let message = match InboundMessage::decode(&envelope) {
        Ok(message) => message,
        Err(error) => {
            tracing::debug!(
                message_type = %envelope.message_type,
                error = %error,
                "Dropping undecodable widget message"
            );
            return None;
        }
    };

    let message_type = match &message {
        InboundMessage::Frame(frame_message) => {
            target.apply_frame_message(frame_message);
            frame_message_type(frame_message)
        }
        // The popup flow holds its own subscription; instances only relay the event.
        InboundMessage::Auth(AuthHandshake::Success(_)) => MessageType::WidgetAuthSuccess,
        InboundMessage::Auth(AuthHandshake::Failure { .. }) => MessageType::WidgetAuthError,
        InboundMessage::HostBound(message_type) => {
            tracing::debug!(message_type = %message_type, "Ignoring host-bound message type");
            return None;
        }
    };

    let payload = envelope.payload.unwrap_or(serde_json::Value::Null);
    target.listeners().emit(message_type, &payload);
    Some(message_type)
}

fn frame_message_type(message: &FrameMessage) -> MessageType {
    match message {
        FrameMessage::Ready => MessageType::WidgetReady,
        FrameMessage::UserSignedIn(_) => MessageType::UserSignedIn,
        FrameMessage::UserSignedOut => MessageType::UserSignedOut,
        FrameMessage::Resize { .. } => MessageType::Resize,
        FrameMessage::Error { .. } => MessageType::Error,
    }
}
