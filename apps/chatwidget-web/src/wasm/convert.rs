use super::*;

use std::rc::Rc;

use chatwidget_core::{AuthUser, WidgetCallbacks, WidgetError, WidgetOptions};
use serde_json::Value;

/// Converts through JSON so the result is a plain JS object, not a `Map`.
pub(super) fn json_to_js(value: &Value) -> JsValue {
    js_sys::JSON::parse(&value.to_string()).unwrap_or(JsValue::NULL)
}

/// `None` for `undefined` and for values JSON cannot represent.
pub(super) fn js_to_json(value: &JsValue) -> Option<Value> {
    if value.is_undefined() {
        return None;
    }
    let encoded = js_sys::JSON::stringify(value).ok()?.as_string()?;
    serde_json::from_str(&encoded).ok()
}

pub(super) fn user_to_js(user: &AuthUser) -> JsValue {
    serde_json::to_value(user).map_or(JsValue::NULL, |value| json_to_js(&value))
}

/// A JS `Error` carrying `code` and `retryable` alongside its message.
pub(super) fn error_to_js(error: &WidgetError) -> JsValue {
    let js_error = js_sys::Error::new(&error.message);
    let target: &JsValue = js_error.as_ref();
    let _ = js_sys::Reflect::set(
        target,
        &JsValue::from_str("code"),
        &JsValue::from_str(error.code.as_str()),
    );
    let _ = js_sys::Reflect::set(
        target,
        &JsValue::from_str("retryable"),
        &JsValue::from_bool(error.retryable),
    );
    js_error.into()
}

fn function_field(object: &JsValue, name: &str) -> Option<js_sys::Function> {
    js_sys::Reflect::get(object, &JsValue::from_str(name))
        .ok()?
        .dyn_into::<js_sys::Function>()
        .ok()
}

fn call_logged(name: &str, result: Result<JsValue, JsValue>) {
    if let Err(error) = result {
        tracing::warn!(callback = name, error = ?error, "Widget callback threw");
    }
}

fn callbacks_from_js(object: &JsValue) -> WidgetCallbacks {
    let mut callbacks = WidgetCallbacks::default();
    if let Some(on_ready) = function_field(object, "onReady") {
        callbacks.on_ready = Some(Rc::new(move || {
            call_logged("onReady", on_ready.call0(&JsValue::NULL));
        }));
    }
    if let Some(on_error) = function_field(object, "onError") {
        callbacks.on_error = Some(Rc::new(move |error: &WidgetError| {
            call_logged("onError", on_error.call1(&JsValue::NULL, &error_to_js(error)));
        }));
    }
    if let Some(on_sign_in) = function_field(object, "onUserSignIn") {
        callbacks.on_user_sign_in = Some(Rc::new(move |user: &AuthUser| {
            call_logged("onUserSignIn", on_sign_in.call1(&JsValue::NULL, &user_to_js(user)));
        }));
    }
    if let Some(on_sign_out) = function_field(object, "onUserSignOut") {
        callbacks.on_user_sign_out = Some(Rc::new(move || {
            call_logged("onUserSignOut", on_sign_out.call0(&JsValue::NULL));
        }));
    }
    callbacks
}

/// Decodes a caller options object. Function-valued fields become callbacks; everything else
/// goes through `WidgetOptions`' serde shape.
pub(super) fn options_from_js(object: &JsValue) -> Result<WidgetOptions, WidgetError> {
    if !object.is_object() {
        return Err(WidgetError::configuration("widget options must be an object"));
    }
    let value = js_to_json(object).unwrap_or(Value::Null);
    let mut options = WidgetOptions::from_json(value)?;
    options.callbacks = callbacks_from_js(object);
    Ok(options)
}
