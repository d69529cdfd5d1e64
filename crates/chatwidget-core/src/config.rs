use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::WidgetError;
use crate::protocol::AuthUser;

pub const DEFAULT_BASE_URL: &str = "https://chat.example.com";
pub const DEFAULT_WIDTH: &str = "100%";
const DEFAULT_HEIGHT_PX: f64 = 600.0;
pub const DEFAULT_MIN_HEIGHT_PX: f64 = 400.0;
pub const DEFAULT_MAX_HEIGHT_PX: f64 = 800.0;
const DEFAULT_ALLOW_GUEST: bool = true;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_USE_POPUP_AUTH: bool = true;
const DEFAULT_FALLBACK_TO_GUEST: bool = true;
const DEFAULT_AUTO_RESIZE: bool = true;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("containerId must be a non-empty string")]
    MissingContainerId,
    #[error("baseUrl must not be empty")]
    EmptyBaseUrl,
    #[error("baseUrl must be an absolute http(s) URL: {0}")]
    InvalidBaseUrl(String),
    #[error("minHeight ({min}) must be a positive number not greater than maxHeight ({max})")]
    InvalidHeightBounds { min: String, max: String },
    #[error("{0} cannot be changed after the widget is created")]
    ImmutableField(&'static str),
    #[error("invalid widget options: {0}")]
    Decode(String),
}

impl From<ConfigError> for WidgetError {
    fn from(error: ConfigError) -> Self {
        WidgetError::configuration(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

impl Theme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::Auto => "auto",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => Some(Self::Light),
            "dark" => Some(Self::Dark),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    #[must_use]
    pub fn color_scheme(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::Auto => "light dark",
        }
    }
}

/// A caller-declared size: a bare number means pixels, a string is passed through as CSS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    Pixels(f64),
    Css(String),
}

pub type ReadyCallback = Rc<dyn Fn()>;
pub type ErrorCallback = Rc<dyn Fn(&WidgetError)>;
pub type SignInCallback = Rc<dyn Fn(&AuthUser)>;
pub type SignOutCallback = Rc<dyn Fn()>;

#[derive(Clone, Default)]
pub struct WidgetCallbacks {
    pub on_ready: Option<ReadyCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_user_sign_in: Option<SignInCallback>,
    pub on_user_sign_out: Option<SignOutCallback>,
}

impl WidgetCallbacks {
    fn overlay(self, patch: WidgetCallbacks) -> Self {
        Self {
            on_ready: patch.on_ready.or(self.on_ready),
            on_error: patch.on_error.or(self.on_error),
            on_user_sign_in: patch.on_user_sign_in.or(self.on_user_sign_in),
            on_user_sign_out: patch.on_user_sign_out.or(self.on_user_sign_out),
        }
    }
}

impl std::fmt::Debug for WidgetCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetCallbacks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_user_sign_in", &self.on_user_sign_in.is_some())
            .field("on_user_sign_out", &self.on_user_sign_out.is_some())
            .finish()
    }
}

/// Raw caller options. Also used as the patch shape for `update_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<Dimension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<Dimension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_guest: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_popup_auth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_to_guest: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_resize: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_styles: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip)]
    pub callbacks: WidgetCallbacks,
}

impl WidgetOptions {
    pub fn for_container(container_id: impl Into<String>) -> Self {
        Self {
            container_id: Some(container_id.into()),
            ..Self::default()
        }
    }

    /// Decodes the serializable part of a caller object; callbacks are attached separately.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|error| ConfigError::Decode(error.to_string()))
    }

    fn overlay(self, patch: WidgetOptions) -> Self {
        Self {
            container_id: patch.container_id.or(self.container_id),
            base_url: patch.base_url.or(self.base_url),
            api_key: patch.api_key.or(self.api_key),
            theme: patch.theme.or(self.theme),
            width: patch.width.or(self.width),
            height: patch.height.or(self.height),
            min_height: patch.min_height.or(self.min_height),
            max_height: patch.max_height.or(self.max_height),
            allow_guest: patch.allow_guest.or(self.allow_guest),
            retry_attempts: patch.retry_attempts.or(self.retry_attempts),
            retry_delay_ms: patch.retry_delay_ms.or(self.retry_delay_ms),
            use_popup_auth: patch.use_popup_auth.or(self.use_popup_auth),
            fallback_to_guest: patch.fallback_to_guest.or(self.fallback_to_guest),
            auto_resize: patch.auto_resize.or(self.auto_resize),
            custom_styles: patch.custom_styles.or(self.custom_styles),
            frame_timeout_ms: patch.frame_timeout_ms.or(self.frame_timeout_ms),
            message_timeout_ms: patch.message_timeout_ms.or(self.message_timeout_ms),
            auth_timeout_ms: patch.auth_timeout_ms.or(self.auth_timeout_ms),
            debug: patch.debug.or(self.debug),
            callbacks: self.callbacks.overlay(patch.callbacks),
        }
    }
}

/// Validated, effective configuration. Only `WidgetConfig::merge` produces a changed copy.
#[derive(Debug, Clone)]
pub struct WidgetConfig {
    pub container_id: String,
    pub base_url: Url,
    pub api_key: Option<String>,
    pub theme: Theme,
    pub width: String,
    pub height: String,
    pub min_height: f64,
    pub max_height: f64,
    pub allow_guest: bool,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub use_popup_auth: bool,
    pub fallback_to_guest: bool,
    pub auto_resize: bool,
    pub custom_styles: BTreeMap<String, String>,
    pub frame_timeout: Duration,
    pub message_timeout: Duration,
    pub auth_timeout: Duration,
    pub debug: bool,
    pub callbacks: WidgetCallbacks,
}

/// Which visual properties differ after a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub theme: bool,
    pub dimensions: bool,
    pub styles: bool,
}

impl ConfigChanges {
    #[must_use]
    pub fn any_visual(self) -> bool {
        self.theme || self.dimensions || self.styles
    }
}

impl WidgetConfig {
    pub fn validate(options: WidgetOptions) -> Result<Self, ConfigError> {
        let container_id = options
            .container_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingContainerId)?
            .to_string();

        let base_url = normalize_base_url(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;

        let theme = match options.theme.as_deref() {
            None => Theme::default(),
            Some(raw) => Theme::parse(raw).unwrap_or_else(|| {
                tracing::warn!(theme = %raw, "Unrecognized widget theme, using auto");
                Theme::Auto
            }),
        };

        let min_height = options.min_height.unwrap_or(DEFAULT_MIN_HEIGHT_PX);
        let max_height = options.max_height.unwrap_or(DEFAULT_MAX_HEIGHT_PX);
        if !(min_height.is_finite() && max_height.is_finite())
            || min_height <= 0.0
            || min_height > max_height
        {
            return Err(ConfigError::InvalidHeightBounds {
                min: min_height.to_string(),
                max: max_height.to_string(),
            });
        }

        let width = options
            .width
            .as_ref()
            .and_then(coerce_width)
            .unwrap_or_else(|| DEFAULT_WIDTH.to_string());
        let height = options
            .height
            .as_ref()
            .and_then(|height| coerce_height(height, min_height, max_height))
            .unwrap_or_else(|| format_px(DEFAULT_HEIGHT_PX.clamp(min_height, max_height)));

        Ok(Self {
            container_id,
            base_url,
            api_key: options
                .api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            theme,
            width,
            height,
            min_height,
            max_height,
            allow_guest: options.allow_guest.unwrap_or(DEFAULT_ALLOW_GUEST),
            retry_attempts: options
                .retry_attempts
                .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
                .max(1),
            retry_delay: Duration::from_millis(
                options.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            use_popup_auth: options.use_popup_auth.unwrap_or(DEFAULT_USE_POPUP_AUTH),
            fallback_to_guest: options
                .fallback_to_guest
                .unwrap_or(DEFAULT_FALLBACK_TO_GUEST),
            auto_resize: options.auto_resize.unwrap_or(DEFAULT_AUTO_RESIZE),
            custom_styles: options.custom_styles.unwrap_or_default(),
            frame_timeout: Duration::from_millis(
                options.frame_timeout_ms.unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            message_timeout: Duration::from_millis(
                options
                    .message_timeout_ms
                    .unwrap_or(DEFAULT_MESSAGE_TIMEOUT_MS),
            ),
            auth_timeout: Duration::from_millis(
                options.auth_timeout_ms.unwrap_or(DEFAULT_AUTH_TIMEOUT_MS),
            ),
            debug: options.debug.unwrap_or(false),
            callbacks: options.callbacks,
        })
    }

    /// Origin of the chat application; the only origin messages are accepted from or posted to.
    #[must_use]
    pub fn target_origin(&self) -> String {
        self.base_url.origin().ascii_serialization()
    }

    /// Merges a partial patch, returning the new configuration and what visibly changed.
    pub fn merge(&self, patch: WidgetOptions) -> Result<(Self, ConfigChanges), ConfigError> {
        if let Some(container_id) = patch.container_id.as_deref() {
            if container_id.trim() != self.container_id {
                return Err(ConfigError::ImmutableField("containerId"));
            }
        }
        if let Some(base_url) = patch.base_url.as_deref() {
            if normalize_base_url(base_url)? != self.base_url {
                return Err(ConfigError::ImmutableField("baseUrl"));
            }
        }

        let next = Self::validate(self.to_options().overlay(patch))?;
        let changes = ConfigChanges {
            theme: next.theme != self.theme,
            dimensions: next.width != self.width || next.height != self.height,
            styles: next.custom_styles != self.custom_styles,
        };
        Ok((next, changes))
    }

    #[must_use]
    pub fn clamp_height(&self, requested: f64) -> f64 {
        requested.clamp(self.min_height, self.max_height)
    }

    fn to_options(&self) -> WidgetOptions {
        WidgetOptions {
            container_id: Some(self.container_id.clone()),
            base_url: Some(self.base_url.to_string()),
            api_key: self.api_key.clone(),
            theme: Some(self.theme.as_str().to_string()),
            width: Some(Dimension::Css(self.width.clone())),
            height: Some(Dimension::Css(self.height.clone())),
            min_height: Some(self.min_height),
            max_height: Some(self.max_height),
            allow_guest: Some(self.allow_guest),
            retry_attempts: Some(self.retry_attempts),
            retry_delay_ms: Some(duration_ms(self.retry_delay)),
            use_popup_auth: Some(self.use_popup_auth),
            fallback_to_guest: Some(self.fallback_to_guest),
            auto_resize: Some(self.auto_resize),
            custom_styles: Some(self.custom_styles.clone()),
            frame_timeout_ms: Some(duration_ms(self.frame_timeout)),
            message_timeout_ms: Some(duration_ms(self.message_timeout)),
            auth_timeout_ms: Some(duration_ms(self.auth_timeout)),
            debug: Some(self.debug),
            callbacks: self.callbacks.clone(),
        }
    }
}

pub fn normalize_base_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    let url = Url::parse(trimmed).map_err(|_| ConfigError::InvalidBaseUrl(trimmed.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(trimmed.to_string()));
    }
    Ok(url)
}

#[must_use]
pub fn format_px(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}px", value as i64)
    } else {
        format!("{value}px")
    }
}

fn coerce_width(width: &Dimension) -> Option<String> {
    match width {
        Dimension::Pixels(value) if value.is_finite() && *value > 0.0 => Some(format_px(*value)),
        Dimension::Pixels(_) => None,
        Dimension::Css(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match parse_pixels(trimmed) {
                Some(value) => Some(format_px(value)),
                None => Some(trimmed.to_string()),
            }
        }
    }
}

fn coerce_height(height: &Dimension, min: f64, max: f64) -> Option<String> {
    match height {
        Dimension::Pixels(value) if value.is_finite() => Some(format_px(value.clamp(min, max))),
        Dimension::Pixels(_) => None,
        Dimension::Css(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match parse_pixels(trimmed) {
                Some(value) => Some(format_px(value.clamp(min, max))),
                None => Some(trimmed.to_string()),
            }
        }
    }
}

/// Accepts `"480"` and `"480px"`; anything else is not a pixel length.
fn parse_pixels(raw: &str) -> Option<f64> {
    let number = raw.strip_suffix("px").unwrap_or(raw).trim();
    number.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
