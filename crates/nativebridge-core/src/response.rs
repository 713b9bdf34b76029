//! Invocation responses and the stable response code table.

use crate::error::ExtensionError;
use crate::value::Value;

/// Response codes shared with the script side.
pub mod code {
    /// Invocation succeeded.
    pub const SUCCESS: i32 = 0;
    /// Placeholder for a synchronous invocation.
    pub const SYNC: i32 = 1;
    /// Placeholder: the result will arrive through the callback.
    pub const ASYNC: i32 = 2;
    /// Placeholder: the method notifies through the callback.
    pub const CALLBACK: i32 = 3;
    /// Extension-defined callback; always repeatable.
    pub const CUSTOM_CALLBACK: i32 = 4;
    pub const CANCEL: i32 = 100;

    pub const GENERIC_ERROR: i32 = 200;
    pub const USER_DENIED: i32 = 201;
    pub const ILLEGAL_ARGUMENT: i32 = 202;
    pub const SERVICE_UNAVAILABLE: i32 = 203;
    pub const TIMEOUT: i32 = 204;
    pub const TOO_MANY_REQUEST: i32 = 205;
    pub const ILLEGAL_REQUEST: i32 = 206;
    pub const DONT_DISTURB_ACCESS: i32 = 207;

    pub const IO_ERROR: i32 = 300;
    pub const FILE_NOT_FOUND: i32 = 301;
    pub const OOM_ERROR: i32 = 400;

    pub const NO_MODULE: i32 = 801;
    pub const NO_ACTION: i32 = 802;
    pub const CONFIG_ERROR: i32 = 803;
    pub const PERMISSION_ERROR: i32 = 804;

    /// Extensions may define private codes at or above this value.
    pub const FEATURE_ERROR: i32 = 1000;
}

/// Immutable `(code, content)` pair produced by an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    code: i32,
    content: Value,
}

impl Response {
    pub fn new(code: i32, content: impl Into<Value>) -> Self {
        Self {
            code,
            content: content.into(),
        }
    }

    /// Success with the given content.
    pub fn ok(content: impl Into<Value>) -> Self {
        Self::new(code::SUCCESS, content)
    }

    pub fn success() -> Self {
        Self::new(code::SUCCESS, "success")
    }

    pub fn cancel() -> Self {
        Self::new(code::CANCEL, "cancel")
    }

    pub fn error(message: impl Into<Value>) -> Self {
        Self::new(code::GENERIC_ERROR, message)
    }

    pub fn generic_error() -> Self {
        Self::new(code::GENERIC_ERROR, "generic error")
    }

    pub fn async_placeholder() -> Self {
        Self::new(code::ASYNC, "")
    }

    pub fn callback_placeholder() -> Self {
        Self::new(code::CALLBACK, "")
    }

    pub fn no_module(name: &str) -> Self {
        Self::new(code::NO_MODULE, format!("no module: {name}"))
    }

    pub fn no_action(action: &str) -> Self {
        Self::new(code::NO_ACTION, format!("no action: {action}"))
    }

    pub fn too_many_requests() -> Self {
        Self::new(code::TOO_MANY_REQUEST, "too many requests")
    }

    pub fn oom() -> Self {
        Self::new(code::OOM_ERROR, "has oom error")
    }

    /// Denial response; `dont_disturb` selects the "do not ask again" variant.
    pub fn user_denied(dont_disturb: bool) -> Self {
        if dont_disturb {
            Self::new(code::DONT_DISTURB_ACCESS, "do not disturb access.")
        } else {
            Self::new(code::USER_DENIED, "user denied")
        }
    }

    pub fn permission_error(message: impl Into<Value>) -> Self {
        Self::new(code::PERMISSION_ERROR, message)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn into_content(self) -> Value {
        self.content
    }

    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }

    /// Responses that bypass the at-most-once latch of a callback channel.
    pub fn is_repeatable(&self) -> bool {
        self.code == code::CUSTOM_CALLBACK
    }

    /// `{"code": .., "content": ..}` as sent to the script side.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code,
            "content": self.content.to_json(),
        })
    }

    /// Inverse of [`Response::to_json`].
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        let code = i32::try_from(json.get("code")?.as_i64()?).ok()?;
        let content = json
            .get("content")
            .cloned()
            .map(Value::from_json)
            .unwrap_or_default();
        Some(Self { code, content })
    }
}

impl From<ExtensionError> for Response {
    fn from(err: ExtensionError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response {{ code={} content={} }}", self.code, self.content)
    }
}
