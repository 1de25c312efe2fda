//! Handler seam for remote-invoked commands and queries.
//!
//! A handler receives the decoded payload data (or `None` when the request
//! carried no payload) and returns either a value to send back or no value.
//! Failures are returned, never panicked; a returned error becomes an
//! error-tagged response frame carrying the failure text.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure raised by a command/query handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Failure text sent back to the requester.
    pub message: String,
}

impl HandlerError {
    /// A handler failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A subscribed command or query handler.
///
/// Handler executions are concurrent with each other and unordered relative
/// to completion; a handler may suspend freely without blocking other inbound
/// frames on the same stream.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one invocation.
    async fn handle(&self, payload: Option<Value>) -> Result<Option<Value>, HandlerError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Option<Value>) -> Result<Option<Value>, HandlerError> {
        (self.0)(payload).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_handler_round_trip() {
        let handler = handler_fn(|payload| async move {
            let name = payload
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            Ok(Some(json!({ "greeting": format!("Hello {name}") })))
        });

        let reply = handler.handle(Some(json!({"name": "Ada"}))).await.unwrap();
        assert_eq!(reply, Some(json!({"greeting": "Hello Ada"})));
    }

    #[tokio::test]
    async fn error_carries_message() {
        let handler = handler_fn(|_| async move { Err(HandlerError::new("boom")) });
        let err = handler.handle(None).await.unwrap_err();
        assert_eq!(err.message, "boom");
    }
}
