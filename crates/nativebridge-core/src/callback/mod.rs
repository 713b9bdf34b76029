//! Callback channels: how a result reaches its caller.
//!
//! ```text
//!   extension ──► LoggingCallback ──► ScriptCallback ──► DeliveryQueue ──► ScriptEngine
//!                        │
//!                        └──────────► BlockingCallback (sync caller awaiting a proxy)
//!                        └──────────► FnCallback       (native host code)
//! ```

pub mod delivery;
pub mod persistent;

pub use delivery::{DeliveryQueue, ScriptEngine, TracingScriptEngine};
pub use persistent::{CallbackContext, CallbackHandler, PersistentCallbackRegistry};

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

use crate::config::names;
use crate::extension::Mode;
use crate::response::Response;
use crate::scope::ScopeId;

/// A way for a response to reach its caller.
pub trait CallbackChannel: Send + Sync {
    fn deliver(&self, response: Response);
}

pub type DynCallback = Arc<dyn CallbackChannel>;

/// Script-side tokens are empty or `-1` when nothing listens.
pub fn is_valid_callback(token: &str) -> bool {
    !token.is_empty() && token != names::UNSET_CALLBACK
}

// ============================================================================
// Script callback
// ============================================================================

/// Delivers to the script engine under a callback token.
///
/// SYNC and ASYNC callbacks fire at most once; later deliveries are dropped
/// unless the response is repeatable. CALLBACK and SYNC_CALLBACK callbacks are
/// notification streams and never latch.
pub struct ScriptCallback {
    token: String,
    mode: Mode,
    queue: DeliveryQueue,
    fired: AtomicBool,
}

impl ScriptCallback {
    pub fn new(token: impl Into<String>, mode: Mode, queue: DeliveryQueue) -> Self {
        Self {
            token: token.into(),
            mode,
            queue,
            fired: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn latches(&self) -> bool {
        matches!(self.mode, Mode::Sync | Mode::Async)
    }
}

impl CallbackChannel for ScriptCallback {
    fn deliver(&self, response: Response) {
        if !is_valid_callback(&self.token) {
            return;
        }
        if self.latches()
            && !response.is_repeatable()
            && self
                .fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            tracing::warn!(callback = %self.token, code = response.code(), "Callback already fired, response dropped");
            return;
        }
        self.queue.push(self.token.clone(), response);
    }
}

// ============================================================================
// Decorators and adapters
// ============================================================================

/// Logs every response, then forwards it unchanged.
pub struct LoggingCallback {
    inner: DynCallback,
    extension: String,
    action: String,
    scope: ScopeId,
}

impl LoggingCallback {
    pub fn new(
        inner: DynCallback,
        extension: impl Into<String>,
        action: impl Into<String>,
        scope: ScopeId,
    ) -> Self {
        Self {
            inner,
            extension: extension.into(),
            action: action.into(),
            scope,
        }
    }
}

impl CallbackChannel for LoggingCallback {
    fn deliver(&self, response: Response) {
        if response.is_success() {
            tracing::debug!(
                scope = %self.scope,
                extension = %self.extension,
                action = %self.action,
                code = response.code(),
                "Extension result"
            );
        } else {
            tracing::info!(
                scope = %self.scope,
                extension = %self.extension,
                action = %self.action,
                code = response.code(),
                content = %response.content(),
                "Extension result"
            );
        }
        self.inner.deliver(response);
    }
}

/// Captures exactly one response for a caller that awaits it.
///
/// Validity is never checked: a synchronous caller always wants its result.
pub struct BlockingCallback {
    sender: Mutex<Option<oneshot::Sender<Response>>>,
}

/// Receiving half of a [`BlockingCallback`].
pub struct ResponseWaiter {
    receiver: oneshot::Receiver<Response>,
}

impl BlockingCallback {
    pub fn new() -> (Arc<Self>, ResponseWaiter) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
            }),
            ResponseWaiter { receiver },
        )
    }

    pub fn has_fired(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl CallbackChannel for BlockingCallback {
    fn deliver(&self, response: Response) {
        let Some(sender) = self.sender.lock().take() else {
            tracing::debug!(code = response.code(), "Blocking callback already fired");
            return;
        };
        let _ = sender.send(response);
    }
}

impl ResponseWaiter {
    /// The captured response, or `None` if every sender went away without
    /// delivering.
    pub async fn wait(self) -> Option<Response> {
        self.receiver.await.ok()
    }
}

/// Adapts a closure. Used by native hosts that call extensions directly.
pub struct FnCallback<F> {
    f: F,
}

impl<F> FnCallback<F>
where
    F: Fn(Response) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> CallbackChannel for FnCallback<F>
where
    F: Fn(Response) + Send + Sync,
{
    fn deliver(&self, response: Response) {
        (self.f)(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::code;
    use tokio::sync::mpsc;

    fn queue() -> (DeliveryQueue, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeliveryQueue::spawn(Arc::new(tx), usize::MAX), rx)
    }

    #[test]
    fn test_valid_tokens() {
        assert!(is_valid_callback("12"));
        assert!(!is_valid_callback(""));
        assert!(!is_valid_callback("-1"));
    }

    #[tokio::test]
    async fn test_async_callback_fires_once() {
        let (queue, mut rx) = queue();
        let callback = ScriptCallback::new("7", Mode::Async, queue);
        callback.deliver(Response::success());
        callback.deliver(Response::error("late"));

        let payload = rx.recv().await.unwrap();
        assert!(payload.contains("\"callback\":\"7\""));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeatable_bypasses_latch() {
        let (queue, mut rx) = queue();
        let callback = ScriptCallback::new("7", Mode::Async, queue);
        callback.deliver(Response::success());
        callback.deliver(Response::new(code::CUSTOM_CALLBACK, "again"));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.unwrap().contains("again"));
    }

    #[tokio::test]
    async fn test_callback_mode_streams() {
        let (queue, mut rx) = queue();
        let callback = ScriptCallback::new("3", Mode::Callback, queue);
        for i in 0..3 {
            callback.deliver(Response::ok(i));
        }
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_invalid_token_is_ignored() {
        let (queue, mut rx) = queue();
        ScriptCallback::new("-1", Mode::Async, queue.clone()).deliver(Response::success());
        ScriptCallback::new("", Mode::Async, queue).deliver(Response::success());
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocking_callback_captures_first() {
        let (callback, waiter) = BlockingCallback::new();
        callback.deliver(Response::ok("first"));
        callback.deliver(Response::ok("second"));
        assert!(callback.has_fired());
        assert_eq!(waiter.wait().await, Some(Response::ok("first")));
    }

    #[tokio::test]
    async fn test_blocking_callback_dropped_without_delivery() {
        let (callback, waiter) = BlockingCallback::new();
        drop(callback);
        assert_eq!(waiter.wait().await, None);
    }

    #[test]
    fn test_logging_callback_is_transparent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let inner: DynCallback = Arc::new(FnCallback::new(move |r: Response| sink.lock().push(r)));
        let logging = LoggingCallback::new(inner, "system.clock", "now", ScopeId::new());
        logging.deliver(Response::error("boom"));
        assert_eq!(seen.lock().as_slice(), &[Response::error("boom")]);
    }
}
