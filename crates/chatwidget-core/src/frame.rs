use std::time::Duration;

use futures::{FutureExt, pin_mut, select_biased};
use url::Url;

use crate::config::{ConfigChanges, WidgetConfig};
use crate::constants::{
    FRAME_ALLOW_POLICY, FRAME_PATH, FRAME_SANDBOX_POLICY, FRAME_TITLE, PROTOCOL_VERSION,
    QUERY_ALLOW_GUEST, QUERY_API_KEY, QUERY_AUTHENTICATED, QUERY_ORIGIN, QUERY_PROTOCOL_VERSION,
    QUERY_THEME,
};
use crate::error::WidgetError;
use crate::host::{FrameHandle, FrameSpec, PageDom, Scheduler, WidgetHost};
use crate::protocol::AuthUser;

#[must_use]
pub fn frame_url(config: &WidgetConfig, page_origin: &str, user: Option<&AuthUser>) -> String {
    let mut url = config.base_url.clone();
    let path = format!("{}{FRAME_PATH}", config.base_url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair(QUERY_THEME, config.theme.as_str())
            .append_pair(QUERY_ALLOW_GUEST, bool_param(config.allow_guest))
            .append_pair(QUERY_ORIGIN, page_origin)
            .append_pair(QUERY_PROTOCOL_VERSION, PROTOCOL_VERSION);
        if let Some(api_key) = config.api_key.as_deref() {
            query.append_pair(QUERY_API_KEY, api_key);
        }
        if user.is_some() {
            query.append_pair(QUERY_AUTHENTICATED, "true");
        }
    }
    url.to_string()
}

/// True when `src` addresses a chat frame created by some copy of this runtime.
#[must_use]
pub fn is_widget_frame_url(src: &str) -> bool {
    let Ok(url) = Url::parse(src) else {
        return false;
    };
    url.path().trim_end_matches('/').ends_with(FRAME_PATH)
        && url
            .query_pairs()
            .any(|(key, _)| key == QUERY_PROTOCOL_VERSION)
}

#[must_use]
pub fn frame_styles(config: &WidgetConfig) -> Vec<(String, String)> {
    let mut styles = vec![
        ("border".to_string(), "none".to_string()),
        ("display".to_string(), "block".to_string()),
        ("width".to_string(), config.width.clone()),
        ("height".to_string(), config.height.clone()),
        (
            "color-scheme".to_string(),
            config.theme.color_scheme().to_string(),
        ),
    ];
    for (property, value) in &config.custom_styles {
        styles.retain(|(existing, _)| existing != property);
        styles.push((property.clone(), value.clone()));
    }
    styles
}

#[must_use]
pub fn frame_spec(config: &WidgetConfig, url: String) -> FrameSpec {
    FrameSpec {
        url,
        title: FRAME_TITLE.to_string(),
        sandbox: FRAME_SANDBOX_POLICY.to_string(),
        allow: FRAME_ALLOW_POLICY.to_string(),
        styles: frame_styles(config),
    }
}

/// Re-applies only the style groups that `changes` marks as different.
pub fn apply_visual_changes(
    host: &dyn WidgetHost,
    frame: &FrameHandle,
    config: &WidgetConfig,
    changes: ConfigChanges,
) {
    if changes.theme {
        host.set_frame_style(frame, "color-scheme", config.theme.color_scheme());
    }
    if changes.dimensions {
        host.set_frame_style(frame, "width", &config.width);
        host.set_frame_style(frame, "height", &config.height);
    }
    if changes.styles {
        for (property, value) in &config.custom_styles {
            host.set_frame_style(frame, property, value);
        }
    }
}

/// Removes the frame on drop unless ownership was released to the caller.
struct FrameGuard<'a> {
    host: &'a dyn WidgetHost,
    handle: Option<FrameHandle>,
}

impl FrameGuard<'_> {
    fn release(mut self) -> Option<FrameHandle> {
        self.handle.take()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.host.remove_frame(handle);
        }
    }
}

enum LoadOutcome {
    Loaded,
    Failed(String),
    TimedOut,
}

/// Creates the frame inside `container_id` and waits for its load signal.
///
/// On error or timeout the frame is removed before returning. If the returned future is dropped
/// while waiting, the frame is removed as well.
pub async fn mount_frame(
    host: &dyn WidgetHost,
    container_id: &str,
    spec: &FrameSpec,
    timeout: Duration,
) -> Result<FrameHandle, WidgetError> {
    let created = host
        .create_frame(container_id, spec)
        .map_err(|error| WidgetError::iframe_load_failed(format!("could not create frame: {error}")))?;
    let guard = FrameGuard {
        host,
        handle: Some(created.handle),
    };

    let outcome = {
        let loaded = created.loaded.fuse();
        let deadline = host.sleep(timeout).fuse();
        pin_mut!(loaded, deadline);
        select_biased! {
            result = loaded => match result {
                Ok(()) => LoadOutcome::Loaded,
                Err(error) => LoadOutcome::Failed(error),
            },
            () = deadline => LoadOutcome::TimedOut,
        }
    };

    match outcome {
        LoadOutcome::Loaded => {
            tracing::debug!(url = %spec.url, "Chat frame loaded");
            guard
                .release()
                .ok_or_else(|| WidgetError::iframe_load_failed("frame handle was released early"))
        }
        LoadOutcome::Failed(error) => Err(WidgetError::iframe_load_failed(format!(
            "chat frame failed to load: {error}"
        ))),
        LoadOutcome::TimedOut => Err(WidgetError::iframe_load_failed(format!(
            "chat frame did not load within {} ms",
            timeout.as_millis()
        ))),
    }
}

fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Theme, WidgetOptions};
    use crate::error::ErrorCode;
    use crate::test_host::{FakeHost, FrameBehavior, PAGE_ORIGIN};
    use std::collections::BTreeMap;

    fn config() -> WidgetConfig {
        WidgetConfig::validate(WidgetOptions::for_container("chat")).expect("valid config")
    }

    #[test]
    fn frame_url_carries_protocol_parameters() {
        let url = frame_url(&config(), PAGE_ORIGIN, None);
        assert_eq!(
            url,
            "https://chat.example.com/widget?theme=auto&allowGuest=true&origin=https%3A%2F%2Fhost.example.net&v=1"
        );
        assert!(is_widget_frame_url(&url));
    }

    #[test]
    fn frame_url_adds_optional_credential_and_auth_flag() {
        let mut options = WidgetOptions::for_container("chat");
        options.api_key = Some("pk_live_123".to_string());
        options.allow_guest = Some(false);
        options.theme = Some("dark".to_string());
        let config = WidgetConfig::validate(options).expect("valid config");
        let url = frame_url(&config, PAGE_ORIGIN, Some(&AuthUser::new("u-1")));
        let parsed = Url::parse(&url).expect("frame url parses");
        let query = parsed
            .query_pairs()
            .into_owned()
            .collect::<BTreeMap<_, _>>();
        assert_eq!(query.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(query.get("allowGuest").map(String::as_str), Some("false"));
        assert_eq!(query.get("apiKey").map(String::as_str), Some("pk_live_123"));
        assert_eq!(query.get("authenticated").map(String::as_str), Some("true"));
    }

    #[test]
    fn widget_frame_detection_requires_path_and_version() {
        assert!(is_widget_frame_url("https://other.example.com/app/widget?v=1"));
        assert!(!is_widget_frame_url("https://chat.example.com/widget"));
        assert!(!is_widget_frame_url("https://chat.example.com/embed?v=1"));
        assert!(!is_widget_frame_url("about:blank"));
    }

    #[test]
    fn custom_styles_override_defaults() {
        let mut options = WidgetOptions::for_container("chat");
        options.custom_styles = Some(BTreeMap::from([
            ("border".to_string(), "1px solid #ccc".to_string()),
            ("border-radius".to_string(), "8px".to_string()),
        ]));
        let config = WidgetConfig::validate(options).expect("valid config");
        let styles = frame_styles(&config);
        let borders = styles
            .iter()
            .filter(|(property, _)| property == "border")
            .collect::<Vec<_>>();
        assert_eq!(borders.len(), 1);
        assert_eq!(borders[0].1, "1px solid #ccc");
        assert!(styles.contains(&("border-radius".to_string(), "8px".to_string())));
        assert_eq!(Theme::Auto.color_scheme(), "light dark");
    }

    #[test]
    fn spec_uses_restrictive_sandbox() {
        let spec = frame_spec(&config(), "https://chat.example.com/widget?v=1".to_string());
        for token in [
            "allow-scripts",
            "allow-same-origin",
            "allow-forms",
            "allow-popups",
        ] {
            assert!(spec.sandbox.split(' ').any(|entry| entry == token));
        }
        assert!(!spec.sandbox.contains("allow-top-navigation"));
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_frame_is_handed_to_caller() {
        let host = FakeHost::with_mount("chat");
        host.set_frame_behavior(FrameBehavior::LoadSilently);
        let spec = frame_spec(&config(), frame_url(&config(), PAGE_ORIGIN, None));
        let handle = mount_frame(&*host, "chat", &spec, Duration::from_secs(15))
            .await
            .expect("frame loads");
        assert_eq!(host.only_frame().container_id, "chat");
        assert_eq!(host.live_timers(), 0);
        host.remove_frame(handle);
        assert!(host.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn load_timeout_removes_frame() {
        let host = FakeHost::with_mount("chat");
        host.set_frame_behavior(FrameBehavior::Hang);
        let spec = frame_spec(&config(), frame_url(&config(), PAGE_ORIGIN, None));
        let started = tokio::time::Instant::now();
        let error = mount_frame(&*host, "chat", &spec, Duration::from_secs(15))
            .await
            .expect_err("frame never loads");
        assert_eq!(error.code, ErrorCode::IframeLoadFailed);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(host.frames().is_empty());
        assert_eq!(host.live_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_removes_frame() {
        let host = FakeHost::with_mount("chat");
        host.set_frame_behavior(FrameBehavior::Fail);
        let spec = frame_spec(&config(), frame_url(&config(), PAGE_ORIGIN, None));
        let error = mount_frame(&*host, "chat", &spec, Duration::from_secs(15))
            .await
            .expect_err("frame errors");
        assert_eq!(error.code, ErrorCode::IframeLoadFailed);
        assert!(error.message.contains("ERR_CONNECTION_REFUSED"));
        assert!(host.frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_mount_is_a_load_failure() {
        let host = FakeHost::new();
        let spec = frame_spec(&config(), frame_url(&config(), PAGE_ORIGIN, None));
        let error = mount_frame(&*host, "chat", &spec, Duration::from_secs(15))
            .await
            .expect_err("no mount");
        assert_eq!(error.code, ErrorCode::IframeLoadFailed);
        assert_eq!(host.live_timers(), 0);
    }
}
