use super::*;

use chatwidget_core::{ChatWidget, ListenerId, MessageType};
use web_sys::Window;

use super::convert::{error_to_js, js_to_json, json_to_js, options_from_js, user_to_js};
use crate::console_log::set_verbose;

struct JsListener {
    message_type: MessageType,
    callback: js_sys::Function,
    id: ListenerId,
}

/// JS handle returned by `ChatWidget.createWidget`. Clones share the widget and its listener
/// table, so `on`/`once`/`off` can hand back a handle for chaining.
#[wasm_bindgen(js_name = ChatWidgetInstance)]
#[derive(Clone)]
pub struct JsChatWidget {
    widget: ChatWidget,
    listeners: Rc<RefCell<Vec<JsListener>>>,
}

fn parse_event(event: &str) -> Result<MessageType, JsValue> {
    MessageType::parse(event)
        .ok_or_else(|| JsValue::from_str(&format!("unknown widget event type: {event}")))
}

impl JsChatWidget {
    fn new(widget: ChatWidget) -> Self {
        Self {
            widget,
            listeners: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Forgets entries the core no longer holds: fired `once` listeners and anything `destroy`
    /// cleared.
    fn prune(&self) {
        let widget = &self.widget;
        self.listeners
            .borrow_mut()
            .retain(|listener| widget.is_subscribed(listener.message_type, listener.id));
    }

    fn subscribe(
        &self,
        event: &str,
        callback: js_sys::Function,
        once: bool,
    ) -> Result<Self, JsValue> {
        let message_type = parse_event(event)?;
        let target = callback.clone();
        let listener = move |payload: &serde_json::Value| -> anyhow::Result<()> {
            target
                .call1(&JsValue::NULL, &json_to_js(payload))
                .map(|_| ())
                .map_err(|error| anyhow::anyhow!("listener threw: {error:?}"))
        };
        let id = if once {
            self.widget.once(message_type, listener)
        } else {
            self.widget.on(message_type, listener)
        };
        self.prune();
        self.listeners.borrow_mut().push(JsListener {
            message_type,
            callback,
            id,
        });
        Ok(self.clone())
    }
}

#[wasm_bindgen(js_class = ChatWidgetInstance)]
impl JsChatWidget {
    /// Returns a handle to the same widget for chaining.
    pub fn on(&self, event: &str, callback: js_sys::Function) -> Result<JsChatWidget, JsValue> {
        self.subscribe(event, callback, false)
    }

    pub fn once(&self, event: &str, callback: js_sys::Function) -> Result<JsChatWidget, JsValue> {
        self.subscribe(event, callback, true)
    }

    /// Removes every registration of `callback` for `event`. Functions are matched with
    /// `Object.is`.
    pub fn off(&self, event: &str, callback: js_sys::Function) -> Result<JsChatWidget, JsValue> {
        let message_type = parse_event(event)?;
        let widget = &self.widget;
        self.listeners.borrow_mut().retain(|listener| {
            let matches = listener.message_type == message_type
                && js_sys::Object::is(&listener.callback, &callback);
            if matches {
                widget.off(message_type, listener.id);
            }
            !matches
        });
        self.prune();
        Ok(self.clone())
    }

    #[wasm_bindgen(js_name = sendMessage)]
    pub fn send_message(&self, message_type: String, payload: JsValue) -> bool {
        self.widget.send_message(&message_type, js_to_json(&payload))
    }

    #[wasm_bindgen(js_name = updateConfig)]
    pub fn update_config(&self, patch: JsValue) -> Result<(), JsValue> {
        let patch = options_from_js(&patch).map_err(|error| error_to_js(&error))?;
        if patch.debug == Some(true) {
            set_verbose(true);
        }
        self.widget
            .update_config(patch)
            .map(|_| ())
            .map_err(|error| error_to_js(&error))
    }

    #[wasm_bindgen(js_name = signIn)]
    pub fn sign_in(&self) -> js_sys::Promise {
        let widget = self.widget.clone();
        wasm_bindgen_futures::future_to_promise(async move {
            widget
                .sign_in()
                .await
                .map(|user| user_to_js(&user))
                .map_err(|error| error_to_js(&error))
        })
    }

    #[wasm_bindgen(js_name = signOut)]
    pub fn sign_out(&self) {
        self.widget.sign_out();
    }

    #[wasm_bindgen(js_name = getUser)]
    pub fn user(&self) -> JsValue {
        self.widget
            .user()
            .map_or(JsValue::NULL, |user| user_to_js(&user))
    }

    #[wasm_bindgen(js_name = isAuthenticated)]
    pub fn is_authenticated(&self) -> bool {
        self.widget.is_authenticated()
    }

    #[wasm_bindgen(js_name = isReady)]
    pub fn is_ready(&self) -> bool {
        self.widget.is_ready()
    }

    #[wasm_bindgen(js_name = getVersion)]
    pub fn version(&self) -> String {
        self.widget.version().to_string()
    }

    #[wasm_bindgen(getter)]
    pub fn id(&self) -> String {
        self.widget.id().to_string()
    }

    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        self.widget.state().as_str().to_string()
    }

    pub fn destroy(&self) {
        self.listeners.borrow_mut().clear();
        self.widget.destroy();
    }
}

fn create_widget(options: JsValue) -> Result<JsValue, JsValue> {
    let options = options_from_js(&options).map_err(|error| error_to_js(&error))?;
    if options.debug == Some(true) {
        set_verbose(true);
    }
    let widget = with_runtime(|runtime| runtime.create_widget(options))?
        .map_err(|error| error_to_js(&error))?;
    Ok(JsChatWidget::new(widget).into())
}

fn destroy_all() -> Result<JsValue, JsValue> {
    let destroyed = with_runtime(WidgetRuntime::destroy_all)?;
    Ok(JsValue::from_f64(destroyed as f64))
}

/// Installs `{createWidget, destroyAll, version}` on `window[name]`.
pub(super) fn install_global(window: &Window, name: &str) -> Result<(), String> {
    let global = js_sys::Object::new();
    let create = Closure::<dyn Fn(JsValue) -> Result<JsValue, JsValue>>::new(create_widget);
    let destroy = Closure::<dyn Fn() -> Result<JsValue, JsValue>>::new(destroy_all);
    let entries: [(&str, JsValue); 3] = [
        ("createWidget", create.into_js_value()),
        ("destroyAll", destroy.into_js_value()),
        ("version", JsValue::from_str(chatwidget_core::WIDGET_VERSION)),
    ];
    for (key, value) in entries {
        js_sys::Reflect::set(&global, &JsValue::from_str(key), &value)
            .map_err(|_| format!("failed to define ChatWidget.{key}"))?;
    }
    js_sys::Reflect::set(window, &JsValue::from_str(name), &global)
        .map_err(|_| format!("failed to install window.{name}"))?;
    Ok(())
}
