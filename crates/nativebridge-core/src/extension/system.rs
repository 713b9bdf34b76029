//! The extension contract.

use async_trait::async_trait;
use std::sync::Arc;

use crate::callback::CallbackChannel;
use crate::error::ExtensionResult;
use crate::pool::WorkerPool;
use crate::response::Response;
use crate::scope::ScopeId;
use crate::value::Value;

/// One invocation of an extension action. Built fresh per call.
#[derive(Clone)]
pub struct Request {
    action: String,
    params: Value,
    callback: Option<Arc<dyn CallbackChannel>>,
    instance_id: i32,
    scope: ScopeId,
    js_callback: String,
}

impl Request {
    pub fn new(action: impl Into<String>, params: Value, scope: ScopeId) -> Self {
        Self {
            action: action.into(),
            params,
            callback: None,
            instance_id: -1,
            scope,
            js_callback: String::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: i32) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_js_callback(mut self, token: impl Into<String>) -> Self {
        self.js_callback = token.into();
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn CallbackChannel>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub(crate) fn set_callback(&mut self, callback: Arc<dyn CallbackChannel>) {
        self.callback = Some(callback);
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn instance_id(&self) -> i32 {
        self.instance_id
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Token the script side uses to correlate callback deliveries.
    pub fn js_callback(&self) -> &str {
        &self.js_callback
    }

    pub fn callback(&self) -> Option<&Arc<dyn CallbackChannel>> {
        self.callback.as_ref()
    }

    /// Deliver through the attached callback. No-op when none is attached.
    pub fn respond(&self, response: Response) {
        if let Some(callback) = &self.callback {
            callback.deliver(response);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("action", &self.action)
            .field("params", &self.params)
            .field("has_callback", &self.callback.is_some())
            .field("instance_id", &self.instance_id)
            .field("scope", &self.scope)
            .field("js_callback", &self.js_callback)
            .finish()
    }
}

/// Native functionality invokable from script code.
///
/// `invoke` runs on the calling context for SYNC and SYNC_CALLBACK actions and
/// on a background pool for ASYNC and CALLBACK actions. For ASYNC actions the
/// returned response is delivered through the request's callback; CALLBACK
/// actions notify through [`Request::respond`] and only an error return is
/// delivered for them.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn invoke(&self, request: Request) -> ExtensionResult<Response>;

    /// Pool for deferred actions. `None` selects the shared I/O pool.
    fn executor(&self, _request: &Request) -> Option<WorkerPool> {
        None
    }

    /// Release state held for `scope`. Non-forced disposal happens on page
    /// change and must keep reserved state; forced disposal ends the scope.
    fn dispose(&self, _scope: ScopeId, _force: bool) {}
}

pub type DynExtension = Arc<dyn Extension>;
