use super::*;

use std::cell::Cell;
use std::collections::HashMap;
use std::time::Duration;

use chatwidget_core::channel::{InboundEvent, MessageChannel};
use chatwidget_core::host::{
    CreatedFrame, DiscoveredFrame, FrameHandle, FrameSpec, HostFuture, KeyValueStore, PageDom,
    PopupHandle, PopupWindows, Scheduler,
};
use chatwidget_core::protocol::Envelope;
use chatwidget_core::WidgetError;
use futures::FutureExt;
use futures::channel::oneshot;
use serde_json::Value;
use web_sys::{
    AddEventListenerOptions, Element, Event, HtmlIFrameElement, MessageEvent,
    Storage, Window,
};

use super::convert::{js_to_json, json_to_js};
use crate::panel::FailurePanel;

type EventClosure = Closure<dyn FnMut(Event)>;

/// A frame this host created, plus the listeners that feed its load signal.
struct OwnedFrame {
    element: HtmlIFrameElement,
    on_load: EventClosure,
    on_error: EventClosure,
}

impl OwnedFrame {
    fn detach(self) {
        let target: &web_sys::EventTarget = self.element.as_ref();
        let _ = target
            .remove_event_listener_with_callback("load", self.on_load.as_ref().unchecked_ref());
        let _ = target
            .remove_event_listener_with_callback("error", self.on_error.as_ref().unchecked_ref());
        self.element.remove();
    }
}

/// [`WidgetHost`] backed by the real page.
pub(super) struct BrowserHost {
    window: Window,
    channel: MessageChannel,
    next_raw: Cell<u64>,
    frames: RefCell<HashMap<u64, OwnedFrame>>,
    discovered: RefCell<HashMap<u64, Element>>,
    popups: RefCell<HashMap<u64, Window>>,
    on_message: Closure<dyn FnMut(MessageEvent)>,
}

impl BrowserHost {
    /// Creates the host and starts forwarding the window's `message` events into its channel.
    /// Events from origins no subscriber trusts are dropped before their payload is read.
    pub(super) fn install(window: &Window) -> Result<Self, String> {
        let channel = MessageChannel::new();
        let forward = channel.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let origin = event.origin();
            if !forward.accepts_origin(&origin) {
                return;
            }
            let data = js_to_json(&event.data()).unwrap_or(Value::Null);
            forward.dispatch(&InboundEvent::new(origin, data));
        });
        window
            .add_event_listener_with_callback("message", on_message.as_ref().unchecked_ref())
            .map_err(|_| "failed to listen for window messages".to_string())?;

        Ok(Self {
            window: window.clone(),
            channel,
            next_raw: Cell::new(0),
            frames: RefCell::new(HashMap::new()),
            discovered: RefCell::new(HashMap::new()),
            popups: RefCell::new(HashMap::new()),
            on_message,
        })
    }

    fn allocate_raw(&self) -> u64 {
        let raw = self.next_raw.get() + 1;
        self.next_raw.set(raw);
        raw
    }

    fn storage(&self) -> Option<Storage> {
        self.window.local_storage().ok().flatten()
    }

    fn frame_element(&self, frame: &FrameHandle) -> Option<HtmlIFrameElement> {
        self.frames
            .borrow()
            .get(&frame.raw())
            .map(|owned| owned.element.clone())
    }
}

impl Drop for BrowserHost {
    fn drop(&mut self) {
        let _ = self.window.remove_event_listener_with_callback(
            "message",
            self.on_message.as_ref().unchecked_ref(),
        );
        for (_, frame) in self.frames.borrow_mut().drain() {
            frame.detach();
        }
    }
}

impl Scheduler for BrowserHost {
    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }

    fn sleep(&self, duration: Duration) -> HostFuture<()> {
        gloo_timers::future::sleep(duration).boxed_local()
    }

    fn spawn_local(&self, task: HostFuture<()>) {
        wasm_bindgen_futures::spawn_local(task);
    }
}

impl PageDom for BrowserHost {
    fn document_ready(&self) -> HostFuture<()> {
        let Some(document) = self.window.document() else {
            return futures::future::ready(()).boxed_local();
        };
        if document.ready_state() != "loading" {
            return futures::future::ready(()).boxed_local();
        }
        let (sender, receiver) = oneshot::channel::<()>();
        let callback = Closure::once_into_js(move || {
            let _ = sender.send(());
        });
        let options = AddEventListenerOptions::new();
        options.set_once(true);
        let registered = document
            .add_event_listener_with_callback_and_add_event_listener_options(
                "DOMContentLoaded",
                callback.unchecked_ref(),
                &options,
            )
            .is_ok();
        async move {
            if registered {
                let _ = receiver.await;
            }
        }
        .boxed_local()
    }

    fn has_mount(&self, container_id: &str) -> bool {
        dom::mount_element(container_id).is_ok()
    }

    fn create_frame(&self, container_id: &str, spec: &FrameSpec) -> Result<CreatedFrame, String> {
        let document = dom::document()?;
        let mount = dom::mount_element(container_id)?;
        let element = document
            .create_element("iframe")
            .map_err(|_| "failed to create iframe element".to_string())?
            .dyn_into::<HtmlIFrameElement>()
            .map_err(|_| "iframe element is not HtmlIFrameElement".to_string())?;
        element.set_src(&spec.url);
        element.set_title(&spec.title);
        element
            .set_attribute("allow", &spec.allow)
            .map_err(|_| "failed to set iframe allow policy".to_string())?;
        element
            .set_attribute("sandbox", &spec.sandbox)
            .map_err(|_| "failed to set iframe sandbox".to_string())?;
        let styles = spec
            .styles
            .iter()
            .map(|(property, value)| (property.as_str(), value.as_str()))
            .collect::<Vec<_>>();
        dom::set_styles(&element, &styles)?;

        let (sender, receiver) = oneshot::channel::<Result<(), String>>();
        let settle = Rc::new(RefCell::new(Some(sender)));
        let load_settle = Rc::clone(&settle);
        let on_load = Closure::<dyn FnMut(Event)>::new(move |_event: Event| {
            if let Some(sender) = load_settle.borrow_mut().take() {
                let _ = sender.send(Ok(()));
            }
        });
        let on_error = Closure::<dyn FnMut(Event)>::new(move |event: Event| {
            if let Some(sender) = settle.borrow_mut().take() {
                let _ = sender.send(Err(format!("frame raised an {} event", event.type_())));
            }
        });
        let target: &web_sys::EventTarget = element.as_ref();
        target
            .add_event_listener_with_callback("load", on_load.as_ref().unchecked_ref())
            .map_err(|_| "failed to listen for iframe load".to_string())?;
        target
            .add_event_listener_with_callback("error", on_error.as_ref().unchecked_ref())
            .map_err(|_| "failed to listen for iframe errors".to_string())?;

        mount
            .append_child(&element)
            .map_err(|_| "failed to append iframe to mount".to_string())?;

        let raw = self.allocate_raw();
        self.frames.borrow_mut().insert(
            raw,
            OwnedFrame {
                element,
                on_load,
                on_error,
            },
        );
        let loaded = async move {
            receiver
                .await
                .unwrap_or_else(|_| Err("frame was removed before it loaded".to_string()))
        }
        .boxed_local();
        Ok(CreatedFrame {
            handle: FrameHandle::from_raw(raw),
            loaded,
        })
    }

    fn set_frame_style(&self, frame: &FrameHandle, property: &str, value: &str) {
        let Some(element) = self.frame_element(frame) else {
            return;
        };
        if element.style().set_property(property, value).is_err() {
            tracing::warn!(property, value, "Failed to update chat frame style");
        }
    }

    fn post_to_frame(
        &self,
        frame: &FrameHandle,
        envelope: &Envelope,
        target_origin: &str,
    ) -> Result<(), String> {
        let element = self
            .frame_element(frame)
            .ok_or_else(|| "frame is no longer attached".to_string())?;
        let content = element
            .content_window()
            .ok_or_else(|| "frame has no content window".to_string())?;
        content
            .post_message(&json_to_js(&envelope.to_value()), target_origin)
            .map_err(|error| format!("postMessage failed: {error:?}"))
    }

    fn remove_frame(&self, frame: FrameHandle) {
        let owned = self.frames.borrow_mut().remove(&frame.raw());
        if let Some(owned) = owned {
            owned.detach();
            return;
        }
        let discovered = self.discovered.borrow_mut().remove(&frame.raw());
        if let Some(element) = discovered {
            element.remove();
        }
    }

    fn discover_frames(&self) -> Vec<DiscoveredFrame> {
        let Ok(document) = dom::document() else {
            return Vec::new();
        };
        let Ok(nodes) = document.query_selector_all("iframe") else {
            return Vec::new();
        };
        let mut discovered = self.discovered.borrow_mut();
        discovered.clear();
        let mut found = Vec::new();
        for index in 0..nodes.length() {
            let Some(element) = nodes
                .item(index)
                .and_then(|node| node.dyn_into::<Element>().ok())
            else {
                continue;
            };
            let src = element.get_attribute("src").unwrap_or_default();
            let container_id = element
                .parent_element()
                .map(|parent| parent.id())
                .filter(|id| !id.is_empty());
            let raw = self.allocate_raw();
            discovered.insert(raw, element);
            found.push(DiscoveredFrame {
                handle: FrameHandle::from_raw(raw),
                src,
                container_id,
            });
        }
        found
    }

    fn render_failure_panel(&self, container_id: &str, error: &WidgetError) {
        if let Err(render_error) =
            dom::render_failure_panel(container_id, &FailurePanel::for_error(error))
        {
            tracing::warn!(error = %render_error, "Failed to render widget failure panel");
        }
    }
}

impl PopupWindows for BrowserHost {
    fn open_popup(&self, url: &str, name: &str, features: &str) -> Option<PopupHandle> {
        let popup = self
            .window
            .open_with_url_and_target_and_features(url, name, features)
            .ok()
            .flatten()?;
        let raw = self.allocate_raw();
        self.popups.borrow_mut().insert(raw, popup);
        Some(PopupHandle::from_raw(raw))
    }

    fn is_popup_closed(&self, popup: &PopupHandle) -> bool {
        self.popups
            .borrow()
            .get(&popup.raw())
            .is_none_or(|window| window.closed().unwrap_or(true))
    }

    fn close_popup(&self, popup: PopupHandle) {
        if let Some(window) = self.popups.borrow_mut().remove(&popup.raw()) {
            let _ = window.close();
        }
    }
}

impl KeyValueStore for BrowserHost {
    fn get_item(&self, key: &str) -> Option<String> {
        self.storage()?.get_item(key).ok().flatten()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        self.storage()
            .ok_or_else(|| "local storage is unavailable".to_string())?
            .set_item(key, value)
            .map_err(|_| format!("failed to write {key} to local storage"))
    }

    fn remove_item(&self, key: &str) {
        if let Some(storage) = self.storage() {
            let _ = storage.remove_item(key);
        }
    }
}

impl WidgetHost for BrowserHost {
    fn page_origin(&self) -> String {
        self.window.location().origin().unwrap_or_default()
    }

    fn message_channel(&self) -> &MessageChannel {
        &self.channel
    }
}
