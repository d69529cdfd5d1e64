#![allow(clippy::needless_pass_by_value)]

#[cfg(any(target_arch = "wasm32", test))]
mod console_log;
#[cfg(any(target_arch = "wasm32", test))]
mod panel;

#[cfg(target_arch = "wasm32")]
mod wasm {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chatwidget_core::{RegistryMode, WidgetHost, WidgetRuntime};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use wasm_bindgen::JsCast;
    use wasm_bindgen::prelude::*;

    use crate::console_log::{ConsoleMethod, console_layer};

    mod convert;
    mod dom;
    mod facade;
    mod host;

    use host::BrowserHost;

    const GLOBAL_NAME: &str = "ChatWidget";

    thread_local! {
        static RUNTIME: RefCell<Option<WidgetRuntime>> = const { RefCell::new(None) };
    }

    #[wasm_bindgen(start)]
    pub fn start() {
        console_error_panic_hook::set_once();
        install_logging();
        if let Err(error) = boot() {
            tracing::error!(error = %error, "Chat widget runtime failed to start");
        }
    }

    fn boot() -> Result<(), String> {
        let window = dom::window()?;
        retire_previous_runtime(&window);

        let host = BrowserHost::install(&window)?;
        let runtime = WidgetRuntime::new(Rc::new(host) as Rc<dyn WidgetHost>, RegistryMode::PerMount);
        RUNTIME.with(|slot| *slot.borrow_mut() = Some(runtime));
        facade::install_global(&window, GLOBAL_NAME)?;
        tracing::info!(version = chatwidget_core::WIDGET_VERSION, "Chat widget runtime installed");
        Ok(())
    }

    /// A second copy of the script tears down whatever the first copy created before taking
    /// over the global.
    fn retire_previous_runtime(window: &web_sys::Window) {
        let Ok(previous) = js_sys::Reflect::get(window, &JsValue::from_str(GLOBAL_NAME)) else {
            return;
        };
        if !previous.is_object() {
            return;
        }
        let Ok(destroy_all) = js_sys::Reflect::get(&previous, &JsValue::from_str("destroyAll"))
        else {
            return;
        };
        if let Ok(destroy_all) = destroy_all.dyn_into::<js_sys::Function>() {
            tracing::info!("Destroying widgets owned by a previously loaded runtime");
            if destroy_all.call0(&previous).is_err() {
                tracing::warn!("Previous runtime's destroyAll threw");
            }
        }
    }

    pub(super) fn with_runtime<T>(
        action: impl FnOnce(&WidgetRuntime) -> T,
    ) -> Result<T, JsValue> {
        RUNTIME.with(|slot| {
            let runtime = slot.borrow();
            runtime
                .as_ref()
                .map(action)
                .ok_or_else(|| JsValue::from_str("chat widget runtime is not initialized"))
        })
    }

    fn install_logging() {
        let installed = tracing_subscriber::registry()
            .with(console_layer(write_console))
            .try_init();
        if installed.is_err() {
            web_sys::console::warn_1(&JsValue::from_str(
                "chat widget: a tracing subscriber is already installed",
            ));
        }
    }

    fn write_console(method: ConsoleMethod, line: &str) {
        let line = JsValue::from_str(line);
        match method {
            ConsoleMethod::Log => web_sys::console::log_1(&line),
            ConsoleMethod::Warn => web_sys::console::warn_1(&line),
            ConsoleMethod::Error => web_sys::console::error_1(&line),
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm::start;

/// Version of the widget runtime this build embeds.
#[must_use]
pub fn widget_version() -> &'static str {
    chatwidget_core::WIDGET_VERSION
}
