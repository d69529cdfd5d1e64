//! Seams between the widget core and the page it runs in.
//!
//! The browser adapter lives in `chatwidget-web`; tests use an in-memory host. Every effect the
//! runtime has on the outside world goes through one of these traits.

use std::time::Duration;

use futures::future::LocalBoxFuture;

use crate::channel::MessageChannel;
use crate::error::WidgetError;
use crate::protocol::Envelope;

pub type HostFuture<T> = LocalBoxFuture<'static, T>;

/// Owned reference to an embedded frame. Not `Clone`: whoever holds it is the only party that may
/// remove the frame.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FrameHandle(u64);

impl FrameHandle {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Owned reference to a popup window.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PopupHandle(u64);

impl PopupHandle {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    pub url: String,
    pub title: String,
    pub sandbox: String,
    pub allow: String,
    pub styles: Vec<(String, String)>,
}

/// A frame found on the page that the caller did not necessarily create.
#[derive(Debug)]
pub struct DiscoveredFrame {
    pub handle: FrameHandle,
    pub src: String,
    /// Id of the element the frame sits in, when it has one.
    pub container_id: Option<String>,
}

/// A created frame plus its load signal (`Err` carries the frame's error event text).
pub struct CreatedFrame {
    pub handle: FrameHandle,
    pub loaded: HostFuture<Result<(), String>>,
}

pub trait Scheduler {
    fn now_ms(&self) -> u64;
    /// Dropping the returned future must cancel the underlying timer.
    fn sleep(&self, duration: Duration) -> HostFuture<()>;
    fn spawn_local(&self, task: HostFuture<()>);
}

pub trait PageDom {
    /// Resolves once the document has finished parsing; immediately if it already has.
    fn document_ready(&self) -> HostFuture<()>;
    fn has_mount(&self, container_id: &str) -> bool;
    fn create_frame(&self, container_id: &str, spec: &FrameSpec) -> Result<CreatedFrame, String>;
    fn set_frame_style(&self, frame: &FrameHandle, property: &str, value: &str);
    fn post_to_frame(
        &self,
        frame: &FrameHandle,
        envelope: &Envelope,
        target_origin: &str,
    ) -> Result<(), String>;
    fn remove_frame(&self, frame: FrameHandle);
    fn discover_frames(&self) -> Vec<DiscoveredFrame>;
    fn render_failure_panel(&self, container_id: &str, error: &WidgetError);
}

pub trait PopupWindows {
    /// `None` when the browser refused to open the window.
    fn open_popup(&self, url: &str, name: &str, features: &str) -> Option<PopupHandle>;
    fn is_popup_closed(&self, popup: &PopupHandle) -> bool;
    fn close_popup(&self, popup: PopupHandle);
}

/// Durable string storage with `localStorage` semantics.
pub trait KeyValueStore {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), String>;
    fn remove_item(&self, key: &str);
}

pub trait WidgetHost: Scheduler + PageDom + PopupWindows + KeyValueStore {
    fn page_origin(&self) -> String;
    fn message_channel(&self) -> &MessageChannel;
}
