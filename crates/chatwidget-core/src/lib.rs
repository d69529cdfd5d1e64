//! Embeddable chat widget runtime.
//!
//! `WidgetRuntime::create_widget` validates caller options, evicts any widget already holding the
//! mount slot and starts the init state machine against a [`host::WidgetHost`]. Browser bindings
//! live in the `chatwidget-web` app; everything here runs the same natively and under wasm.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod auth;
pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod host;
pub mod listeners;
pub mod machine;
pub mod protocol;
pub mod registry;
pub mod router;
mod task;
pub mod widget;

#[cfg(test)]
mod test_host;

pub use auth::{AuthError, AuthSession};
pub use channel::{InboundEvent, MessageChannel, Subscription};
pub use config::{ConfigChanges, Dimension, Theme, WidgetCallbacks, WidgetConfig, WidgetOptions};
pub use constants::{PROTOCOL_VERSION, WIDGET_VERSION};
pub use error::{ErrorCode, WidgetError};
pub use host::WidgetHost;
pub use listeners::ListenerId;
pub use machine::LifecycleState;
pub use protocol::{AuthUser, Envelope, MessageType};
pub use registry::RegistryMode;
pub use widget::{ChatWidget, WidgetRuntime};
