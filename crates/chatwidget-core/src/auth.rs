use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::{FutureExt, pin_mut, select_biased};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::constants::{
    AUTH_STORAGE_KEY, POPUP_HEIGHT, POPUP_POLL_INTERVAL, POPUP_WIDTH, POPUP_WINDOW_NAME,
    QUERY_MODE, QUERY_MODE_WIDGET_AUTH, QUERY_ORIGIN, SESSION_MAX_AGE_MS, SIGN_IN_PATH,
};
use crate::error::{ErrorCode, WidgetError};
use crate::host::{KeyValueStore, PopupHandle, PopupWindows, Scheduler, WidgetHost};
use crate::protocol::{AuthHandshake, AuthUser, Envelope, InboundMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("sign-in popup was blocked by the browser")]
    PopupBlocked,
    #[error("sign-in was cancelled before it completed")]
    Cancelled,
    #[error("sign-in did not complete within {0} ms")]
    TimedOut(u64),
    #[error("sign-in failed: {0}")]
    Rejected(String),
}

impl From<AuthError> for WidgetError {
    fn from(error: AuthError) -> Self {
        let code = match error {
            AuthError::PopupBlocked => ErrorCode::PopupBlocked,
            AuthError::TimedOut(_) => ErrorCode::Timeout,
            AuthError::Cancelled | AuthError::Rejected(_) => ErrorCode::AuthFailed,
        };
        WidgetError::new(code, error.to_string())
    }
}

/// Identity cached after a completed popup handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user: AuthUser,
    pub timestamp: u64,
}

impl AuthSession {
    #[must_use]
    pub fn capture(user: AuthUser, now_ms: u64) -> Self {
        Self {
            user,
            timestamp: now_ms,
        }
    }

    /// A timestamp in the future cannot come from a real handshake and is treated as stale.
    #[must_use]
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms
            .checked_sub(self.timestamp)
            .is_some_and(|age| age < SESSION_MAX_AGE_MS)
    }
}

/// Reads the cached session, deleting it if it is stale or undecodable.
pub fn load_cached_session<S: KeyValueStore + ?Sized>(
    store: &S,
    now_ms: u64,
) -> Option<AuthSession> {
    let raw = store.get_item(AUTH_STORAGE_KEY)?;
    match serde_json::from_str::<AuthSession>(&raw) {
        Ok(session) if session.is_fresh(now_ms) => Some(session),
        Ok(session) => {
            tracing::debug!(
                captured_at = session.timestamp,
                "Discarding stale widget auth session"
            );
            store.remove_item(AUTH_STORAGE_KEY);
            None
        }
        Err(error) => {
            tracing::warn!(error = %error, "Discarding unreadable widget auth session");
            store.remove_item(AUTH_STORAGE_KEY);
            None
        }
    }
}

pub fn persist_session<S: KeyValueStore + ?Sized>(store: &S, session: &AuthSession) {
    let encoded = match serde_json::to_string(session) {
        Ok(encoded) => encoded,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to encode widget auth session");
            return;
        }
    };
    if let Err(error) = store.set_item(AUTH_STORAGE_KEY, &encoded) {
        tracing::warn!(error = %error, "Failed to persist widget auth session");
    }
}

pub fn clear_session<S: KeyValueStore + ?Sized>(store: &S) {
    store.remove_item(AUTH_STORAGE_KEY);
}

#[must_use]
pub fn sign_in_url(base_url: &Url, page_origin: &str) -> String {
    let mut url = base_url.clone();
    let path = format!("{}{SIGN_IN_PATH}", base_url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair(QUERY_MODE, QUERY_MODE_WIDGET_AUTH)
        .append_pair(QUERY_ORIGIN, page_origin);
    url.to_string()
}

fn popup_features() -> String {
    format!("popup=yes,width={POPUP_WIDTH},height={POPUP_HEIGHT},resizable=yes,scrollbars=yes")
}

/// Closes the popup on drop unless it was already closed or handed back.
struct PopupGuard<'a> {
    host: &'a dyn WidgetHost,
    handle: Option<PopupHandle>,
}

impl PopupGuard<'_> {
    fn is_closed(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| self.host.is_popup_closed(handle))
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !self.host.is_popup_closed(&handle) {
                self.host.close_popup(handle);
            }
        }
    }
}

impl Drop for PopupGuard<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

enum PopupOutcome {
    Handshake(AuthHandshake),
    Closed,
    TimedOut,
}

/// Runs the popup handshake against `base_url`'s sign-in page.
///
/// Exactly one of three branches settles the flow: a handshake message from the chat origin, the
/// popup being closed (polled every second), or `timeout`. Whichever wins, the other two are
/// dropped, which cancels their timers, and the message subscription is released. Dropping the
/// returned future closes the popup.
pub async fn authenticate(
    host: &dyn WidgetHost,
    base_url: &Url,
    timeout: Duration,
) -> Result<AuthUser, AuthError> {
    let expected_origin = base_url.origin().ascii_serialization();
    let url = sign_in_url(base_url, &host.page_origin());
    let Some(handle) = host.open_popup(&url, POPUP_WINDOW_NAME, &popup_features()) else {
        tracing::warn!(url = %url, "Sign-in popup was blocked");
        return Err(AuthError::PopupBlocked);
    };
    let mut popup = PopupGuard {
        host,
        handle: Some(handle),
    };
    tracing::debug!(url = %url, "Opened sign-in popup");

    let (sender, receiver) = oneshot::channel::<AuthHandshake>();
    let settle = Rc::new(RefCell::new(Some(sender)));
    let listener_settle = Rc::clone(&settle);
    let subscription = host
        .message_channel()
        .subscribe_from(expected_origin, move |event| {
            let Ok(envelope) = Envelope::decode(&event.data) else {
                return;
            };
            let Ok(InboundMessage::Auth(handshake)) = InboundMessage::decode(&envelope) else {
                return;
            };
            if let Some(sender) = listener_settle.borrow_mut().take() {
                let _ = sender.send(handshake);
            }
        });

    let outcome = {
        let handshake = receiver.fuse();
        let closed = watch_popup_closed(&popup).fuse();
        let deadline = host.sleep(timeout).fuse();
        pin_mut!(handshake, closed, deadline);
        select_biased! {
            result = handshake => match result {
                Ok(handshake) => PopupOutcome::Handshake(handshake),
                Err(_) => PopupOutcome::Closed,
            },
            () = closed => PopupOutcome::Closed,
            () = deadline => PopupOutcome::TimedOut,
        }
    };
    drop(subscription);
    settle.borrow_mut().take();

    match outcome {
        PopupOutcome::Handshake(AuthHandshake::Success(user)) => {
            persist_session(host, &AuthSession::capture(user.clone(), host.now_ms()));
            popup.close();
            tracing::info!(user_id = %user.id, "Widget sign-in completed");
            Ok(user)
        }
        PopupOutcome::Handshake(AuthHandshake::Failure { error }) => {
            popup.close();
            Err(AuthError::Rejected(error))
        }
        PopupOutcome::Closed => Err(AuthError::Cancelled),
        PopupOutcome::TimedOut if popup.is_closed() => Err(AuthError::Cancelled),
        PopupOutcome::TimedOut => {
            popup.close();
            Err(AuthError::TimedOut(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ))
        }
    }
}

async fn watch_popup_closed(popup: &PopupGuard<'_>) {
    loop {
        popup.host.sleep(POPUP_POLL_INTERVAL).await;
        if popup.is_closed() {
            return;
        }
    }
}
