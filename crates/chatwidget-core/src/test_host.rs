//! In-memory [`WidgetHost`] for tests: scripted frames and popups, a recorded DOM, and a live
//! timer counter so leaked timers show up as a non-zero count.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use serde_json::{Value, json};
use url::Url;

use crate::channel::{InboundEvent, MessageChannel};
use crate::error::WidgetError;
use crate::host::{
    CreatedFrame, DiscoveredFrame, FrameHandle, FrameSpec, HostFuture, KeyValueStore, PageDom,
    PopupHandle, PopupWindows, Scheduler, WidgetHost,
};
use crate::protocol::Envelope;

pub(crate) const PAGE_ORIGIN: &str = "https://host.example.net";
pub(crate) const CHAT_ORIGIN: &str = "https://chat.example.com";
const BASE_EPOCH_MS: u64 = 1_750_000_000_000;
const READY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameBehavior {
    /// Fires load, then the chat app posts `WIDGET_READY`.
    LoadAndReady,
    /// Fires load but never signals readiness.
    LoadSilently,
    /// Never fires load or error.
    Hang,
    /// Fires the error event.
    Fail,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeFrame {
    pub container_id: String,
    pub spec: FrameSpec,
    pub styles: BTreeMap<String, String>,
    pub posted: Vec<(Envelope, String)>,
    pub owned: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct FakePopup {
    pub url: String,
    pub closed: bool,
    pub closed_by_runtime: bool,
}

struct TimerGuard(Rc<Cell<usize>>);

impl TimerGuard {
    fn new(counter: &Rc<Cell<usize>>) -> Self {
        counter.set(counter.get() + 1);
        Self(Rc::clone(counter))
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

pub(crate) struct FakeHost {
    channel: MessageChannel,
    started: tokio::time::Instant,
    live_timers: Rc<Cell<usize>>,
    mounts: RefCell<BTreeSet<String>>,
    document_loading: Cell<bool>,
    ready_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    next_raw: Cell<u64>,
    frames: Rc<RefCell<BTreeMap<u64, FakeFrame>>>,
    frame_behavior: Cell<FrameBehavior>,
    frames_created: Cell<usize>,
    failure_panels: RefCell<Vec<(String, WidgetError)>>,
    popups: RefCell<BTreeMap<u64, FakePopup>>,
    block_popups: Cell<bool>,
    reject_posts: Cell<bool>,
    storage: RefCell<BTreeMap<String, String>>,
}

impl FakeHost {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            channel: MessageChannel::new(),
            started: tokio::time::Instant::now(),
            live_timers: Rc::new(Cell::new(0)),
            mounts: RefCell::new(BTreeSet::new()),
            document_loading: Cell::new(false),
            ready_waiters: RefCell::new(Vec::new()),
            next_raw: Cell::new(0),
            frames: Rc::new(RefCell::new(BTreeMap::new())),
            frame_behavior: Cell::new(FrameBehavior::LoadAndReady),
            frames_created: Cell::new(0),
            failure_panels: RefCell::new(Vec::new()),
            popups: RefCell::new(BTreeMap::new()),
            block_popups: Cell::new(false),
            reject_posts: Cell::new(false),
            storage: RefCell::new(BTreeMap::new()),
        })
    }

    pub(crate) fn with_mount(container_id: &str) -> Rc<Self> {
        let host = Self::new();
        host.add_mount(container_id);
        host
    }

    pub(crate) fn add_mount(&self, container_id: &str) {
        self.mounts.borrow_mut().insert(container_id.to_string());
    }

    pub(crate) fn set_document_loading(&self, loading: bool) {
        self.document_loading.set(loading);
    }

    pub(crate) fn finish_loading(&self) {
        self.document_loading.set(false);
        for waiter in self.ready_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(());
        }
    }

    pub(crate) fn set_frame_behavior(&self, behavior: FrameBehavior) {
        self.frame_behavior.set(behavior);
    }

    pub(crate) fn block_popups(&self) {
        self.block_popups.set(true);
    }

    /// Makes every later `post_to_frame` fail as a cross-origin `postMessage` would.
    pub(crate) fn reject_posts(&self) {
        self.reject_posts.set(true);
    }

    pub(crate) fn live_timers(&self) -> usize {
        self.live_timers.get()
    }

    pub(crate) fn frames(&self) -> Vec<FakeFrame> {
        self.frames.borrow().values().cloned().collect()
    }

    pub(crate) fn frames_created(&self) -> usize {
        self.frames_created.get()
    }

    pub(crate) fn only_frame(&self) -> FakeFrame {
        let frames = self.frames();
        assert_eq!(frames.len(), 1, "expected exactly one frame, found {frames:?}");
        frames.into_iter().next().expect("one frame")
    }

    /// Simulates a frame left behind by an earlier copy of the runtime.
    pub(crate) fn inject_orphan_frame(&self, container_id: &str, src: &str) {
        let raw = self.allocate_raw();
        self.frames.borrow_mut().insert(
            raw,
            FakeFrame {
                container_id: container_id.to_string(),
                spec: FrameSpec {
                    url: src.to_string(),
                    title: String::new(),
                    sandbox: String::new(),
                    allow: String::new(),
                    styles: Vec::new(),
                },
                styles: BTreeMap::new(),
                posted: Vec::new(),
                owned: false,
            },
        );
    }

    pub(crate) fn failure_panels(&self) -> Vec<(String, WidgetError)> {
        self.failure_panels.borrow().clone()
    }

    pub(crate) fn popups(&self) -> Vec<FakePopup> {
        self.popups.borrow().values().cloned().collect()
    }

    pub(crate) fn user_closes_popup(&self) {
        for popup in self.popups.borrow_mut().values_mut() {
            popup.closed = true;
        }
    }

    pub(crate) fn storage_item(&self, key: &str) -> Option<String> {
        self.storage.borrow().get(key).cloned()
    }

    pub(crate) fn deliver(&self, origin: &str, data: Value) {
        self.channel.dispatch(&InboundEvent::new(origin, data));
    }

    pub(crate) fn deliver_from_chat(&self, message_type: &str, payload: Option<Value>) {
        let mut data = json!({ "type": message_type });
        if let (Some(payload), Some(object)) = (payload, data.as_object_mut()) {
            object.insert("payload".to_string(), payload);
        }
        self.deliver(CHAT_ORIGIN, data);
    }

    fn allocate_raw(&self) -> u64 {
        let raw = self.next_raw.get() + 1;
        self.next_raw.set(raw);
        raw
    }
}

impl Scheduler for FakeHost {
    fn now_ms(&self) -> u64 {
        let elapsed = tokio::time::Instant::now().duration_since(self.started);
        BASE_EPOCH_MS + u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) -> HostFuture<()> {
        let guard = TimerGuard::new(&self.live_timers);
        async move {
            let _guard = guard;
            tokio::time::sleep(duration).await;
        }
        .boxed_local()
    }

    fn spawn_local(&self, task: HostFuture<()>) {
        drop(tokio::task::spawn_local(task));
    }
}

impl PageDom for FakeHost {
    fn document_ready(&self) -> HostFuture<()> {
        if !self.document_loading.get() {
            return futures::future::ready(()).boxed_local();
        }
        let (sender, receiver) = oneshot::channel();
        self.ready_waiters.borrow_mut().push(sender);
        async move {
            let _ = receiver.await;
        }
        .boxed_local()
    }

    fn has_mount(&self, container_id: &str) -> bool {
        self.mounts.borrow().contains(container_id)
    }

    fn create_frame(&self, container_id: &str, spec: &FrameSpec) -> Result<CreatedFrame, String> {
        if !self.has_mount(container_id) {
            return Err(format!("mount #{container_id} is missing"));
        }
        let raw = self.allocate_raw();
        self.frames_created.set(self.frames_created.get() + 1);
        self.frames.borrow_mut().insert(
            raw,
            FakeFrame {
                container_id: container_id.to_string(),
                spec: spec.clone(),
                styles: spec.styles.iter().cloned().collect(),
                posted: Vec::new(),
                owned: true,
            },
        );

        let loaded = match self.frame_behavior.get() {
            FrameBehavior::LoadAndReady => {
                let frames = Rc::clone(&self.frames);
                let channel = self.channel.clone();
                let origin = Url::parse(&spec.url)
                    .map(|url| url.origin().ascii_serialization())
                    .unwrap_or_default();
                drop(tokio::task::spawn_local(async move {
                    tokio::time::sleep(READY_DELAY).await;
                    if frames.borrow().contains_key(&raw) {
                        channel.dispatch(&InboundEvent::new(
                            origin,
                            json!({ "type": "WIDGET_READY" }),
                        ));
                    }
                }));
                futures::future::ready(Ok(())).boxed_local()
            }
            FrameBehavior::LoadSilently => futures::future::ready(Ok(())).boxed_local(),
            FrameBehavior::Hang => futures::future::pending().boxed_local(),
            FrameBehavior::Fail => {
                futures::future::ready(Err("net::ERR_CONNECTION_REFUSED".to_string()))
                    .boxed_local()
            }
        };
        Ok(CreatedFrame {
            handle: FrameHandle::from_raw(raw),
            loaded,
        })
    }

    fn set_frame_style(&self, frame: &FrameHandle, property: &str, value: &str) {
        if let Some(frame) = self.frames.borrow_mut().get_mut(&frame.raw()) {
            frame
                .styles
                .insert(property.to_string(), value.to_string());
        }
    }

    fn post_to_frame(
        &self,
        frame: &FrameHandle,
        envelope: &Envelope,
        target_origin: &str,
    ) -> Result<(), String> {
        if self.reject_posts.get() {
            return Err(format!("target origin {target_origin} does not match the frame"));
        }
        let mut frames = self.frames.borrow_mut();
        let frame = frames
            .get_mut(&frame.raw())
            .ok_or_else(|| "frame has no content window".to_string())?;
        frame
            .posted
            .push((envelope.clone(), target_origin.to_string()));
        Ok(())
    }

    fn remove_frame(&self, frame: FrameHandle) {
        self.frames.borrow_mut().remove(&frame.raw());
    }

    fn discover_frames(&self) -> Vec<DiscoveredFrame> {
        self.frames
            .borrow()
            .iter()
            .map(|(raw, frame)| DiscoveredFrame {
                handle: FrameHandle::from_raw(*raw),
                src: frame.spec.url.clone(),
                container_id: Some(frame.container_id.clone()),
            })
            .collect()
    }

    fn render_failure_panel(&self, container_id: &str, error: &WidgetError) {
        self.failure_panels
            .borrow_mut()
            .push((container_id.to_string(), error.clone()));
    }
}

impl PopupWindows for FakeHost {
    fn open_popup(&self, url: &str, _name: &str, _features: &str) -> Option<PopupHandle> {
        if self.block_popups.get() {
            return None;
        }
        let raw = self.allocate_raw();
        self.popups.borrow_mut().insert(
            raw,
            FakePopup {
                url: url.to_string(),
                closed: false,
                closed_by_runtime: false,
            },
        );
        Some(PopupHandle::from_raw(raw))
    }

    fn is_popup_closed(&self, popup: &PopupHandle) -> bool {
        self.popups
            .borrow()
            .get(&popup.raw())
            .is_none_or(|popup| popup.closed)
    }

    fn close_popup(&self, popup: PopupHandle) {
        if let Some(popup) = self.popups.borrow_mut().get_mut(&popup.raw()) {
            popup.closed = true;
            popup.closed_by_runtime = true;
        }
    }
}

impl KeyValueStore for FakeHost {
    fn get_item(&self, key: &str) -> Option<String> {
        self.storage.borrow().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        self.storage
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        self.storage.borrow_mut().remove(key);
    }
}

impl WidgetHost for FakeHost {
    fn page_origin(&self) -> String {
        PAGE_ORIGIN.to_string()
    }

    fn message_channel(&self) -> &MessageChannel {
        &self.channel
    }
}
