//! Demo extensions wired into the CLI host.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use nativebridge_core::extension::{
    DynExtension, Extension, ExtensionFactory, ExtensionMetadata, Method, Mode, Namespace, Request,
};
use nativebridge_core::{BridgeContextBuilder, ExtensionError, ExtensionResult, Response, Value};

// ============================================================================
// system.clock
// ============================================================================

pub struct ClockExtension;

impl ClockExtension {
    pub const NAME: &'static str = "system.clock";

    pub fn metadata() -> Result<ExtensionMetadata> {
        Ok(ExtensionMetadata::new(Self::NAME, "system")
            .with_method(Method::new("now", Mode::Sync)?)
            .with_method(Method::new("iso", Mode::Sync)?))
    }
}

#[async_trait]
impl Extension for ClockExtension {
    async fn invoke(&self, request: Request) -> ExtensionResult<Response> {
        let now = chrono::Utc::now();
        match request.action() {
            "now" => Ok(Response::ok(now.timestamp_millis())),
            "iso" => Ok(Response::ok(now.to_rfc3339())),
            other => Err(ExtensionError::illegal_argument(other)),
        }
    }
}

// ============================================================================
// system.upload
// ============================================================================

/// Pretends to upload the `data` parameter.
pub struct UploadExtension;

impl UploadExtension {
    pub const NAME: &'static str = "system.upload";

    pub fn metadata() -> Result<ExtensionMetadata> {
        Ok(ExtensionMetadata::new(Self::NAME, "system").with_method(
            Method::builder("send", Mode::Async)
                .permission("network")
                .build()?,
        ))
    }
}

#[async_trait]
impl Extension for UploadExtension {
    async fn invoke(&self, request: Request) -> ExtensionResult<Response> {
        let data = request
            .params()
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ExtensionError::illegal_argument("data is required"))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::debug!(bytes = data.len(), "Upload finished");
        Ok(Response::ok(Value::map([(
            "bytes",
            Value::from(data.len() as i64),
        )])))
    }
}

// ============================================================================
// echo (module)
// ============================================================================

pub struct EchoExtension;

impl EchoExtension {
    pub const NAME: &'static str = "echo";

    pub fn metadata() -> Result<ExtensionMetadata> {
        Ok(ExtensionMetadata::new(Self::NAME, "echo")
            .with_method(Method::new("echo", Mode::Sync)?)
            .with_method(Method::new("ticks", Mode::Callback)?))
    }
}

#[async_trait]
impl Extension for EchoExtension {
    async fn invoke(&self, request: Request) -> ExtensionResult<Response> {
        match request.action() {
            "echo" => Ok(Response::ok(request.params().clone())),
            "ticks" => {
                let count = request
                    .params()
                    .get("count")
                    .and_then(Value::as_i64)
                    .unwrap_or(3);
                for tick in 1..=count {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    request.respond(Response::ok(tick));
                }
                Ok(Response::success())
            }
            other => Err(ExtensionError::illegal_argument(other)),
        }
    }
}

fn factory<E>(make: fn() -> E) -> ExtensionFactory
where
    E: Extension + 'static,
{
    Arc::new(move || Ok(Arc::new(make()) as DynExtension))
}

/// Add every demo extension to `builder`.
pub fn register(builder: BridgeContextBuilder) -> Result<BridgeContextBuilder> {
    Ok(builder
        .register_built_in(ClockExtension::metadata()?, factory(|| ClockExtension))
        .register_built_in(UploadExtension::metadata()?, factory(|| UploadExtension))
        .register(
            Namespace::Module,
            EchoExtension::metadata()?,
            factory(|| EchoExtension),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativebridge_core::BridgeContext;
    use nativebridge_core::scope::ScopeInfo;

    #[tokio::test]
    async fn test_clock_now_is_recent() {
        let ctx = register(BridgeContext::builder()).unwrap().build().unwrap();
        let scope = ctx.create_scope(ScopeInfo::new("nativebridge.cli"));
        let before = chrono::Utc::now().timestamp_millis();

        let response = ctx
            .dispatcher(scope)
            .invoke(ClockExtension::NAME, "now", Value::Null, "", -1)
            .await;

        assert!(response.is_success());
        assert!(response.content().as_i64().unwrap() >= before);
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let ctx = register(BridgeContext::builder()).unwrap().build().unwrap();
        let scope = ctx.create_scope(ScopeInfo::new("nativebridge.cli"));
        let params = Value::parse(r#"{"hello": "world"}"#).unwrap();

        let response = ctx
            .dispatcher(scope)
            .invoke(EchoExtension::NAME, "echo", params.clone(), "", -1)
            .await;

        assert_eq!(response.content(), &params);
    }

    #[tokio::test]
    async fn test_upload_send_delivers_once_on_token() {
        use nativebridge_core::permission::StaticPermissionManager;

        let permissions = Arc::new(StaticPermissionManager::new());
        permissions.grant("network");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let ctx = register(BridgeContext::builder())
            .unwrap()
            .permission_manager(permissions)
            .script_engine(Arc::new(tx))
            .build()
            .unwrap();
        let scope = ctx.create_scope(ScopeInfo::new("nativebridge.cli"));
        let params = Value::parse(r#"{"data": "abcd"}"#).unwrap();

        let response = ctx
            .dispatcher(scope)
            .invoke(UploadExtension::NAME, "send", params, "5", -1)
            .await;
        assert_eq!(response.code(), nativebridge_core::response::code::ASYNC);

        let payload: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["callback"], "5");
        assert_eq!(payload["data"]["code"], 0);
        assert_eq!(payload["data"]["content"]["bytes"], 4);
    }
}

