use std::time::Duration;

pub const WIDGET_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: &str = "1";

pub const AUTH_STORAGE_KEY: &str = "chatwidget.auth.v1";
pub const SESSION_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1_000;

pub const FRAME_PATH: &str = "/widget";
pub const SIGN_IN_PATH: &str = "/sign-in";
pub const FRAME_TITLE: &str = "Chat assistant";
pub const FRAME_SANDBOX_POLICY: &str =
    "allow-scripts allow-same-origin allow-forms allow-popups allow-popups-to-escape-sandbox";
pub const FRAME_ALLOW_POLICY: &str = "clipboard-write";

pub const POPUP_WINDOW_NAME: &str = "chatwidget-auth";
pub const POPUP_WIDTH: u32 = 500;
pub const POPUP_HEIGHT: u32 = 640;
pub const POPUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const MOUNT_READY_TIMEOUT: Duration = Duration::from_secs(5);

pub const QUERY_THEME: &str = "theme";
pub const QUERY_ALLOW_GUEST: &str = "allowGuest";
pub const QUERY_ORIGIN: &str = "origin";
pub const QUERY_PROTOCOL_VERSION: &str = "v";
pub const QUERY_API_KEY: &str = "apiKey";
pub const QUERY_AUTHENTICATED: &str = "authenticated";
pub const QUERY_MODE: &str = "mode";
pub const QUERY_MODE_WIDGET_AUTH: &str = "widget-auth";
