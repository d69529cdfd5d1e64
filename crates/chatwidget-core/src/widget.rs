//! Public facade: `WidgetRuntime::create_widget` and the `ChatWidget` handle it returns.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::{FutureExt, pin_mut, select_biased};
use serde_json::Value;

use crate::auth::{
    AuthError, AuthSession, authenticate, clear_session, load_cached_session, persist_session,
};
use crate::channel::Subscription;
use crate::config::{ConfigChanges, WidgetCallbacks, WidgetConfig, WidgetOptions, format_px};
use crate::constants::{MOUNT_READY_TIMEOUT, WIDGET_VERSION};
use crate::error::{ErrorCode, WidgetError};
use crate::frame::{apply_visual_changes, frame_spec, frame_url, mount_frame};
use crate::host::{FrameHandle, HostFuture, PageDom, Scheduler, WidgetHost};
use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::machine::{self, InitSequence, Lifecycle, LifecycleState, RetryPolicy};
use crate::protocol::{AuthUser, Envelope, FrameMessage, MessageType};
use crate::registry::{InstanceRegistry, RegistryMode};
use crate::router::{self, RouteTarget};
use crate::task::{TaskHandle, cancellable};

/// Owns the instance registry and creates widgets against one host.
pub struct WidgetRuntime {
    host: Rc<dyn WidgetHost>,
    registry: Rc<InstanceRegistry<ChatWidget>>,
}

impl WidgetRuntime {
    pub fn new(host: Rc<dyn WidgetHost>, mode: RegistryMode) -> Self {
        Self {
            host,
            registry: Rc::new(InstanceRegistry::new(mode)),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &InstanceRegistry<ChatWidget> {
        &self.registry
    }

    /// Validates `options`, evicts whatever holds the mount slot, then starts a new widget.
    ///
    /// Validation errors return before any page effect. The returned handle is usable
    /// immediately; readiness arrives later through `on_ready` or `WIDGET_READY`.
    pub fn create_widget(&self, options: WidgetOptions) -> Result<ChatWidget, WidgetError> {
        let config = WidgetConfig::validate(options)?;
        let container_id = config.container_id.clone();

        for previous in self.registry.take_conflicts(&container_id) {
            tracing::info!(
                instance_id = %previous.id(),
                container_id = %container_id,
                "Replacing existing chat widget"
            );
            previous.destroy();
        }
        let swept = self.registry.sweep_orphans(&*self.host, &container_id);
        if swept > 0 {
            tracing::warn!(swept, container_id = %container_id, "Removed orphaned widget frames");
        }

        let widget = ChatWidget::construct(
            Rc::clone(&self.host),
            config,
            Rc::downgrade(&self.registry),
        );
        if let Some(stale) = self
            .registry
            .claim(&container_id, widget.id(), widget.clone())
        {
            stale.destroy();
        }
        widget.start();
        Ok(widget)
    }

    /// Destroys every registered widget. Returns how many were destroyed.
    pub fn destroy_all(&self) -> usize {
        let widgets = self.registry.drain();
        for widget in &widgets {
            widget.destroy();
        }
        widgets.len()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        WIDGET_VERSION
    }
}

impl std::fmt::Debug for WidgetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WidgetRuntime")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Handle to one embedded chat widget. Clones share the same instance.
#[derive(Clone)]
pub struct ChatWidget {
    inner: Rc<WidgetInner>,
}

struct WidgetInner {
    id: String,
    this: Weak<WidgetInner>,
    host: Rc<dyn WidgetHost>,
    registry: Weak<InstanceRegistry<ChatWidget>>,
    config: RefCell<WidgetConfig>,
    lifecycle: Lifecycle,
    listeners: ListenerRegistry,
    router: RefCell<Option<Subscription>>,
    frame: RefCell<Option<FrameHandle>>,
    frame_ready: Cell<bool>,
    ready_waiter: RefCell<Option<oneshot::Sender<()>>>,
    user: RefCell<Option<AuthUser>>,
    last_message_at: Cell<Option<u64>>,
    init_task: RefCell<Option<TaskHandle>>,
    sign_in_task: RefCell<Option<TaskHandle>>,
}

impl ChatWidget {
    fn construct(
        host: Rc<dyn WidgetHost>,
        config: WidgetConfig,
        registry: Weak<InstanceRegistry<ChatWidget>>,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| WidgetInner {
            id: uuid::Uuid::new_v4().to_string(),
            this: this.clone(),
            host,
            registry,
            config: RefCell::new(config),
            lifecycle: Lifecycle::new(),
            listeners: ListenerRegistry::new(),
            router: RefCell::new(None),
            frame: RefCell::new(None),
            frame_ready: Cell::new(false),
            ready_waiter: RefCell::new(None),
            user: RefCell::new(None),
            last_message_at: Cell::new(None),
            init_task: RefCell::new(None),
            sign_in_task: RefCell::new(None),
        });
        Self { inner }
    }

    fn start(&self) {
        let inner = Rc::clone(&self.inner);
        let (task, handle) = cancellable(async move { machine::drive(&*inner).await });
        *self.inner.init_task.borrow_mut() = Some(handle);
        self.inner.host.spawn_local(
            async move {
                if task.await.is_err() {
                    tracing::debug!("Widget initialization cancelled");
                }
            }
            .boxed_local(),
        );
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    #[must_use]
    pub fn config(&self) -> WidgetConfig {
        self.inner.config.borrow().clone()
    }

    /// Failed attempts so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.lifecycle.attempts()
    }

    /// Host clock reading of the last accepted inbound message.
    #[must_use]
    pub fn last_message_at(&self) -> Option<u64> {
        self.inner.last_message_at.get()
    }

    pub fn on(
        &self,
        message_type: MessageType,
        callback: impl Fn(&Value) -> anyhow::Result<()> + 'static,
    ) -> ListenerId {
        let callback: Listener = Rc::new(callback);
        self.inner.listeners.on(message_type, callback)
    }

    pub fn once(
        &self,
        message_type: MessageType,
        callback: impl Fn(&Value) -> anyhow::Result<()> + 'static,
    ) -> ListenerId {
        let callback: Listener = Rc::new(callback);
        self.inner.listeners.once(message_type, callback)
    }

    pub fn off(&self, message_type: MessageType, id: ListenerId) -> bool {
        self.inner.listeners.off(message_type, id)
    }

    /// False once `id` was removed by `off`, fired as a `once` listener or cleared by `destroy`.
    #[must_use]
    pub fn is_subscribed(&self, message_type: MessageType, id: ListenerId) -> bool {
        self.inner.listeners.contains(message_type, id)
    }

    /// Posts `{type, payload}` to the frame. Returns false (and logs) when the widget is not ready.
    pub fn send_message(&self, message_type: &str, payload: Option<Value>) -> bool {
        self.inner.post(&Envelope {
            message_type: message_type.to_string(),
            payload,
        })
    }

    /// Merges `patch`, re-applies the visual properties that changed and forwards the patch to
    /// the frame.
    pub fn update_config(&self, patch: WidgetOptions) -> Result<ConfigChanges, WidgetError> {
        let inner = &self.inner;
        if inner.lifecycle.current() == LifecycleState::Destroyed {
            tracing::debug!(instance_id = %inner.id, "update_config on destroyed widget ignored");
            return Ok(ConfigChanges::default());
        }
        let forwarded = serde_json::to_value(&patch)
            .map_err(|error| WidgetError::configuration(format!("unencodable patch: {error}")))?;
        let (next, changes) = inner.config.borrow().merge(patch)?;
        *inner.config.borrow_mut() = next;

        if let Some(frame) = inner.frame.borrow().as_ref() {
            apply_visual_changes(&*inner.host, frame, &inner.config.borrow(), changes);
        }
        if inner.lifecycle.current() == LifecycleState::Ready {
            inner.post(&Envelope::update_config(forwarded));
        }
        Ok(changes)
    }

    /// Runs the popup handshake on demand. Starting a new sign-in cancels one still in flight.
    pub async fn sign_in(&self) -> Result<AuthUser, WidgetError> {
        let inner = &self.inner;
        if inner.lifecycle.current() == LifecycleState::Destroyed {
            return Err(WidgetError::new(
                ErrorCode::AuthFailed,
                "widget has been destroyed",
            ));
        }
        let (base_url, timeout) = {
            let config = inner.config.borrow();
            (config.base_url.clone(), config.auth_timeout)
        };
        let host = Rc::clone(&inner.host);
        let (flow, handle) =
            cancellable(async move { authenticate(&*host, &base_url, timeout).await });
        let previous = inner.sign_in_task.borrow_mut().replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }

        let Ok(result) = flow.await else {
            return Err(AuthError::Cancelled.into());
        };
        let user = result?;
        inner.adopt_user(user.clone());
        Ok(user)
    }

    /// Forgets the cached identity, tells the frame and fires `on_user_sign_out`.
    pub fn sign_out(&self) {
        let inner = &self.inner;
        if inner.lifecycle.current() == LifecycleState::Destroyed {
            return;
        }
        clear_session(&*inner.host);
        inner.user.borrow_mut().take();
        if inner.lifecycle.current() == LifecycleState::Ready {
            inner.post(&Envelope::sign_out());
        }
        let callbacks = inner.callbacks();
        if let Some(on_user_sign_out) = callbacks.on_user_sign_out {
            invoke_callback("onUserSignOut", &*on_user_sign_out);
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<AuthUser> {
        self.inner.user.borrow().clone()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.user.borrow().is_some()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle.current() == LifecycleState::Ready
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        WIDGET_VERSION
    }

    /// Tears down everything the instance owns. Safe to call any number of times.
    ///
    /// In-flight init and sign-in work is dropped before this returns, so its frame, popup,
    /// timers and channel subscriptions are already released.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.advance(LifecycleState::Destroyed) {
            return;
        }
        let init_task = inner.init_task.borrow_mut().take();
        if let Some(task) = init_task {
            task.cancel();
        }
        let sign_in_task = inner.sign_in_task.borrow_mut().take();
        if let Some(task) = sign_in_task {
            task.cancel();
        }
        inner.ready_waiter.borrow_mut().take();
        inner.router.borrow_mut().take();
        let frame = inner.frame.borrow_mut().take();
        if let Some(frame) = frame {
            inner.host.remove_frame(frame);
        }
        inner.listeners.clear();

        let container_id = inner.config.borrow().container_id.clone();
        if let Some(registry) = inner.registry.upgrade() {
            drop(registry.release(&container_id, &inner.id));
        }
        tracing::info!(instance_id = %inner.id, container_id = %container_id, "Chat widget destroyed");
    }
}

impl std::fmt::Debug for ChatWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatWidget")
            .field("id", &self.inner.id)
            .field("state", &self.inner.lifecycle.current())
            .finish_non_exhaustive()
    }
}

impl WidgetInner {
    fn callbacks(&self) -> WidgetCallbacks {
        self.config.borrow().callbacks.clone()
    }

    fn adopt_user(&self, user: AuthUser) {
        *self.user.borrow_mut() = Some(user.clone());
        if let Some(on_user_sign_in) = self.callbacks().on_user_sign_in {
            invoke_callback("onUserSignIn", || on_user_sign_in(&user));
        }
    }

    fn report_error(&self, error: &WidgetError) {
        if let Some(on_error) = self.callbacks().on_error {
            invoke_callback("onError", || on_error(error));
        }
    }

    fn post(&self, envelope: &Envelope) -> bool {
        if self.lifecycle.current() != LifecycleState::Ready {
            tracing::warn!(
                message_type = %envelope.message_type,
                state = %self.lifecycle.current(),
                "Chat widget is not ready, dropping outbound message"
            );
            return false;
        }
        let target_origin = self.config.borrow().target_origin();
        let posted = {
            let frame = self.frame.borrow();
            let Some(frame) = frame.as_ref() else {
                return false;
            };
            self.host.post_to_frame(frame, envelope, &target_origin)
        };
        let Err(error) = posted else {
            return true;
        };
        tracing::warn!(
            message_type = %envelope.message_type,
            error = %error,
            "Failed to post message to chat frame"
        );
        self.report_error(&WidgetError::cross_origin(format!(
            "could not deliver {} to {target_origin}: {error}",
            envelope.message_type
        )));
        false
    }

    async fn locate_mount(&self, container_id: &str) -> Result<(), WidgetError> {
        if self.host.has_mount(container_id) {
            return Ok(());
        }
        {
            let ready = self.host.document_ready().fuse();
            let deadline = self.host.sleep(MOUNT_READY_TIMEOUT).fuse();
            pin_mut!(ready, deadline);
            select_biased! {
                () = ready => {},
                () = deadline => {},
            }
        }
        if self.host.has_mount(container_id) {
            Ok(())
        } else {
            Err(WidgetError::container_not_found(container_id))
        }
    }

    /// Returns the identity the frame should start with, running the popup handshake only when
    /// guest mode is off, a credential is configured and nothing valid is cached.
    async fn resolve_identity(
        &self,
        config: &WidgetConfig,
    ) -> Result<Option<AuthUser>, WidgetError> {
        if let Some(session) = load_cached_session(&*self.host, self.host.now_ms()) {
            *self.user.borrow_mut() = Some(session.user.clone());
            return Ok(Some(session.user));
        }
        let current = self.user.borrow().clone();
        if current.is_some() || config.allow_guest || config.api_key.is_none() {
            return Ok(current);
        }
        if !config.use_popup_auth {
            tracing::debug!("Popup sign-in disabled, the chat frame handles sign-in");
            return Ok(None);
        }
        if !self.lifecycle.advance(LifecycleState::Authenticating) {
            return Err(destroyed_during_init());
        }
        match authenticate(&*self.host, &config.base_url, config.auth_timeout).await {
            Ok(user) => {
                self.adopt_user(user.clone());
                Ok(Some(user))
            }
            Err(error) if config.fallback_to_guest => {
                tracing::warn!(error = %error, "Widget sign-in failed, continuing as guest");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn install_router(&self, config: &WidgetConfig) {
        if self.router.borrow().is_some() {
            return;
        }
        let subscription = router::install(
            self.host.message_channel(),
            config.target_origin(),
            self.this.clone(),
        );
        *self.router.borrow_mut() = Some(subscription);
    }

    async fn await_ready(&self, timeout: Duration) -> Result<(), WidgetError> {
        if self.frame_ready.get() {
            return Ok(());
        }
        let (sender, receiver) = oneshot::channel();
        *self.ready_waiter.borrow_mut() = Some(sender);
        let signalled = {
            let ready = receiver.fuse();
            let deadline = self.host.sleep(timeout).fuse();
            pin_mut!(ready, deadline);
            select_biased! {
                result = ready => result.is_ok(),
                () = deadline => false,
            }
        };
        self.ready_waiter.borrow_mut().take();
        if signalled {
            Ok(())
        } else {
            Err(WidgetError::timeout(format!(
                "chat frame did not signal readiness within {} ms",
                timeout.as_millis()
            )))
        }
    }
}

impl InitSequence for WidgetInner {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn sleep(&self, duration: Duration) -> HostFuture<()> {
        self.host.sleep(duration)
    }

    fn retry_policy(&self) -> RetryPolicy {
        let config = self.config.borrow();
        RetryPolicy {
            max_attempts: config.retry_attempts,
            delay: config.retry_delay,
        }
    }

    async fn attempt(&self) -> Result<(), WidgetError> {
        let config = self.config.borrow().clone();
        self.locate_mount(&config.container_id).await?;
        let user = self.resolve_identity(&config).await?;

        if !self.lifecycle.advance(LifecycleState::CreatingFrame) {
            return Err(destroyed_during_init());
        }
        self.install_router(&config);
        self.frame_ready.set(false);
        let url = frame_url(&config, &self.host.page_origin(), user.as_ref());
        let spec = frame_spec(&config, url);
        let frame = mount_frame(&*self.host, &config.container_id, &spec, config.frame_timeout)
            .await?;
        if self.lifecycle.current() == LifecycleState::Destroyed {
            self.host.remove_frame(frame);
            return Err(destroyed_during_init());
        }
        *self.frame.borrow_mut() = Some(frame);

        if !self.lifecycle.advance(LifecycleState::AwaitingReady) {
            return Err(destroyed_during_init());
        }
        self.await_ready(config.message_timeout).await
    }

    fn discard_attempt(&self) {
        self.ready_waiter.borrow_mut().take();
        self.frame_ready.set(false);
        let frame = self.frame.borrow_mut().take();
        if let Some(frame) = frame {
            self.host.remove_frame(frame);
        }
    }

    fn complete(&self) {
        if let Some(on_ready) = self.callbacks().on_ready {
            invoke_callback("onReady", &*on_ready);
        }
    }

    fn fail(&self, error: &WidgetError) {
        let container_id = self.config.borrow().container_id.clone();
        self.host.render_failure_panel(&container_id, error);
        self.report_error(error);
    }
}

impl RouteTarget for WidgetInner {
    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    fn record_inbound(&self) {
        self.last_message_at.set(Some(self.host.now_ms()));
    }

    fn apply_frame_message(&self, message: &FrameMessage) {
        match message {
            FrameMessage::Ready => {
                self.frame_ready.set(true);
                if let Some(waiter) = self.ready_waiter.borrow_mut().take() {
                    let _ = waiter.send(());
                }
            }
            FrameMessage::UserSignedIn(user) => {
                persist_session(
                    &*self.host,
                    &AuthSession::capture(user.clone(), self.host.now_ms()),
                );
                self.adopt_user(user.clone());
            }
            FrameMessage::UserSignedOut => {
                clear_session(&*self.host);
                self.user.borrow_mut().take();
                if let Some(on_user_sign_out) = self.callbacks().on_user_sign_out {
                    invoke_callback("onUserSignOut", &*on_user_sign_out);
                }
            }
            FrameMessage::Resize { height } => {
                let config = self.config.borrow();
                if !config.auto_resize {
                    tracing::debug!(height, "Ignoring resize request, auto-resize is off");
                    return;
                }
                let clamped = config.clamp_height(*height);
                if let Some(frame) = self.frame.borrow().as_ref() {
                    self.host.set_frame_style(frame, "height", &format_px(clamped));
                }
            }
            FrameMessage::Error { message } => {
                self.report_error(&WidgetError::new(ErrorCode::NetworkError, message.clone()));
            }
        }
    }
}

fn destroyed_during_init() -> WidgetError {
    WidgetError::initialization_failed("widget was destroyed during initialization")
        .with_retryable(false)
}

/// Runs a caller-supplied callback, logging a panic instead of unwinding into the event loop.
fn invoke_callback(name: &'static str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::warn!(callback = name, "Widget callback panicked");
    }
}

#[cfg(test)]
impl ChatWidget {
    pub(crate) fn frame_raw(&self) -> Option<u64> {
        self.inner.frame.borrow().as_ref().map(FrameHandle::raw)
    }
}
