//! Invocation dispatcher.
//!
//! ```text
//! RESOLVING ──► SYNC_EXEC ──────────────────────────────► DELIVERED (return value)
//!     │     └─► ASYNC_EXEC ─► [permission] ─► pool ──────► DELIVERED (callback)
//!     │     └─► CALLBACK_DEFER ─► [permission] ─► pool ──► DELIVERED (callback, repeated)
//!     └─► terminal error response (no module / no action / permission)
//! ```
//!
//! Nothing raised by an extension escapes `invoke`: errors and panics become
//! responses, returned directly for synchronous actions and delivered through
//! the callback for deferred ones.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::callback::{
    BlockingCallback, DynCallback, LoggingCallback, ScriptCallback, is_valid_callback,
};
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::extension::{LoadedExtension, Mode, Namespace, Request};
use crate::response::Response;
use crate::scope::ScopeId;
use crate::value::Value;

/// Dispatches script calls for one scope.
#[derive(Clone)]
pub struct InvocationDispatcher {
    ctx: Arc<BridgeContext>,
    scope: ScopeId,
}

impl InvocationDispatcher {
    pub fn new(ctx: Arc<BridgeContext>, scope: ScopeId) -> Self {
        Self { ctx, scope }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    /// Script call convention. Deferred results later reach the script engine
    /// under `js_callback`.
    pub async fn invoke(
        &self,
        name: &str,
        action: &str,
        params: Value,
        js_callback: &str,
        instance_id: i32,
    ) -> Response {
        tracing::debug!(
            scope = %self.scope,
            extension = %name,
            action = %action,
            callback = %js_callback,
            "Invoke"
        );
        self.dispatch(name, action, params, js_callback, instance_id, None)
            .await
    }

    /// Native call convention: every result, including resolution errors and
    /// synchronous results, is also delivered to `callback`.
    pub async fn invoke_with_callback(
        &self,
        name: &str,
        action: &str,
        params: Value,
        instance_id: i32,
        callback: DynCallback,
    ) -> Response {
        tracing::debug!(scope = %self.scope, extension = %name, action = %action, "Invoke with host callback");
        self.dispatch(name, action, params, "", instance_id, Some(callback))
            .await
    }

    async fn dispatch(
        &self,
        name: &str,
        action: &str,
        params: Value,
        js_callback: &str,
        instance_id: i32,
        real_callback: Option<DynCallback>,
    ) -> Response {
        let loaded = match self.resolve(name, action) {
            Ok(loaded) => loaded,
            Err(response) => {
                self.reply(&response, js_callback, real_callback.as_ref());
                return response;
            }
        };

        let metadata = loaded.metadata();
        let Some(caller_mode) = metadata.mode(action) else {
            tracing::warn!(extension = %name, action = %action, "No such action");
            let response = Response::no_action(action);
            self.reply(&response, js_callback, real_callback.as_ref());
            return response;
        };

        let (exec_action, exec_mode) =
            match self.ctx.proxies().proxy_for(loaded.registered_name(), action) {
                Some(target) => match metadata.mode(&target.action) {
                    Some(mode) => {
                        tracing::debug!(
                            extension = %name,
                            action = %action,
                            target = %target.action,
                            caller_mode = %caller_mode,
                            target_mode = %mode,
                            "Proxy redirect"
                        );
                        (target.action, mode)
                    }
                    None => {
                        let response = Response::no_action(&target.action);
                        self.reply(&response, js_callback, real_callback.as_ref());
                        return response;
                    }
                },
                None => (action.to_string(), caller_mode),
            };

        let mut request = Request::new(exec_action, params, self.scope)
            .with_instance_id(instance_id)
            .with_js_callback(js_callback);

        // Synchronous caller, deferred target: await the first delivery.
        if caller_mode == Mode::Sync && exec_mode.is_deferred() {
            let (blocking, waiter) = BlockingCallback::new();
            request.set_callback(Arc::new(LoggingCallback::new(
                blocking,
                name,
                action,
                self.scope,
            )));
            self.spawn_deferred(loaded, request, true);
            let response = waiter.wait().await.unwrap_or_else(|| {
                tracing::warn!(extension = %name, action = %action, "Proxied action finished without a result");
                Response::generic_error()
            });
            if let Some(callback) = real_callback {
                callback.deliver(response.clone());
            }
            return response;
        }

        // Deferred caller, synchronous target: the body still runs on the pool
        // and its return value goes to the callback.
        if caller_mode.is_deferred() && exec_mode == Mode::Sync {
            request.set_callback(self.make_callback(
                name,
                action,
                js_callback,
                caller_mode,
                real_callback,
            ));
            self.spawn_deferred(loaded, request, true);
            return placeholder(caller_mode);
        }

        match exec_mode {
            Mode::Sync => {
                let response = run_inline(&loaded, request).await;
                if let Some(callback) = real_callback {
                    callback.deliver(response.clone());
                }
                response
            }
            Mode::SyncCallback => {
                request.set_callback(self.make_callback(
                    name,
                    action,
                    js_callback,
                    exec_mode,
                    real_callback,
                ));
                run_inline(&loaded, request).await
            }
            Mode::Async | Mode::Callback => {
                request.set_callback(self.make_callback(
                    name,
                    action,
                    js_callback,
                    exec_mode,
                    real_callback,
                ));
                self.spawn_deferred(loaded, request, exec_mode == Mode::Async);
                placeholder(exec_mode)
            }
        }
    }

    /// Find the extension for `name`: features first (subject to availability
    /// and background policy), then modules, then widgets.
    fn resolve(&self, name: &str, action: &str) -> Result<Arc<LoadedExtension>, Response> {
        let ctx = &self.ctx;
        let features = ctx.catalog(Namespace::Feature);
        let mut gated = false;

        if ctx.is_feature_available(name, self.scope) {
            match features.get(name, ctx.proxies()) {
                Ok(Some(loaded)) => {
                    if !ctx.is_allowed_to_invoke(name, action, self.scope) {
                        tracing::warn!(scope = %self.scope, extension = %name, action = %action, "Refused in background");
                        return Err(Response::permission_error(format!(
                            "Refuse to use this interfaces in background: {name}"
                        )));
                    }
                    return Ok(loaded);
                }
                Ok(None) => {}
                Err(err) => return Err(unavailable(name, &err)),
            }
        } else if features.contains(name, ctx.proxies()) {
            gated = true;
        }

        for namespace in [Namespace::Module, Namespace::Widget] {
            match ctx.catalog(namespace).get(name, ctx.proxies()) {
                Ok(Some(loaded)) => return Ok(loaded),
                Ok(None) => {}
                Err(err) => return Err(unavailable(name, &err)),
            }
        }

        if gated {
            tracing::warn!(scope = %self.scope, extension = %name, "Feature not declared");
            Err(Response::permission_error(format!(
                "Extension not available: {name}"
            )))
        } else {
            tracing::warn!(scope = %self.scope, extension = %name, "No such extension");
            Err(Response::no_module(name))
        }
    }

    fn make_callback(
        &self,
        name: &str,
        action: &str,
        js_callback: &str,
        mode: Mode,
        real_callback: Option<DynCallback>,
    ) -> DynCallback {
        let inner: DynCallback = match real_callback {
            Some(callback) => callback,
            None => Arc::new(ScriptCallback::new(
                js_callback,
                mode,
                self.ctx.delivery().clone(),
            )),
        };
        Arc::new(LoggingCallback::new(inner, name, action, self.scope))
    }

    /// Terminal responses reach the caller's callback too.
    fn reply(&self, response: &Response, js_callback: &str, real_callback: Option<&DynCallback>) {
        match real_callback {
            Some(callback) => callback.deliver(response.clone()),
            None if is_valid_callback(js_callback) => self
                .ctx
                .delivery()
                .push(js_callback.to_string(), response.clone()),
            None => {}
        }
    }

    fn spawn_deferred(&self, loaded: Arc<LoadedExtension>, request: Request, deliver_result: bool) {
        let pool = loaded
            .instance()
            .executor(&request)
            .unwrap_or_else(|| self.ctx.io_pool().clone());
        let permissions: Vec<String> = loaded
            .metadata()
            .permissions(request.action())
            .map(<[String]>::to_vec)
            .unwrap_or_default();

        if permissions.is_empty() {
            pool.spawn(run_deferred(loaded, request, deliver_result));
            return;
        }

        let manager = Arc::clone(self.ctx.permissions());
        let scope = self.scope;
        let body_pool = pool.clone();
        pool.spawn(async move {
            let outcome = manager.request_permissions(scope, &permissions).await;
            match outcome.denial_response() {
                None => {
                    body_pool.spawn(run_deferred(loaded, request, deliver_result));
                }
                Some(denial) => {
                    tracing::info!(
                        scope = %scope,
                        action = %request.action(),
                        code = denial.code(),
                        "Permission denied"
                    );
                    request.respond(denial);
                }
            }
        });
    }
}

fn placeholder(mode: Mode) -> Response {
    match mode {
        Mode::Callback => Response::callback_placeholder(),
        _ => Response::async_placeholder(),
    }
}

fn unavailable(name: &str, err: &BridgeError) -> Response {
    tracing::error!(extension = %name, error = %err, "Extension not available");
    Response::permission_error(format!("Extension not available: {name}"))
}

/// Run the body, turning errors and panics into error responses.
async fn invoke_guarded(loaded: &LoadedExtension, request: Request) -> Result<Response, Response> {
    let extension = loaded.metadata().name().to_string();
    let action = request.action().to_string();

    match AssertUnwindSafe(loaded.instance().invoke(request))
        .catch_unwind()
        .await
    {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            tracing::warn!(extension = %extension, action = %action, code = err.code(), error = %err, "Extension failed");
            Err(Response::from(err))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(extension = %extension, action = %action, panic = %message, "Extension panicked");
            Err(Response::error(format!("{extension}.{action}: {message}")))
        }
    }
}

async fn run_inline(loaded: &LoadedExtension, request: Request) -> Response {
    match invoke_guarded(loaded, request).await {
        Ok(response) | Err(response) => response,
    }
}

async fn run_deferred(loaded: Arc<LoadedExtension>, request: Request, deliver_result: bool) {
    let callback = request.callback().cloned();
    let outcome = invoke_guarded(&loaded, request).await;
    let Some(callback) = callback else {
        return;
    };
    match outcome {
        Ok(response) if deliver_result => callback.deliver(response),
        Ok(_) => {}
        Err(response) => callback.deliver(response),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
