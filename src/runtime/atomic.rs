//! Backends that perform atomic operations on behalf of a running program.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;

use super::cancel::CancelToken;
use super::transport::{Transport, TransportError};

/// One operation request.
#[derive(Debug, Clone)]
pub struct AtomicRequest {
    /// Dotted operation key (`Browser.open`).
    pub key: String,
    /// Keyword arguments with control options removed.
    pub args: Map<String, JsonValue>,
    /// Correlation context: `[flowLine, unitId]`.
    pub info: JsonValue,
    /// How long to wait for the operation.
    pub timeout: Duration,
    /// Fires when the owning execution is force-stopped.
    pub cancel: CancelToken,
}

/// Atomic operation failures.
#[derive(Debug, Error)]
pub enum AtomicError {
    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),
    /// No implementation is registered under the key.
    #[error("unknown operation '{0}'")]
    Unknown(String),
    /// The request could not be delivered or answered.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Performs atomic operations.
pub trait AtomicBackend: Send + Sync {
    /// Run `request` and return its result.
    fn invoke(&self, request: &AtomicRequest) -> Result<JsonValue, AtomicError>;
}

type Operation = Box<dyn Fn(&AtomicRequest) -> Result<JsonValue, AtomicError> + Send + Sync>;

/// In-process registry of operations, keyed by operation key.
#[derive(Default)]
pub struct LocalBackend {
    operations: HashMap<String, Operation>,
}

impl LocalBackend {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `operation` under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, operation: F) -> &mut Self
    where
        F: Fn(&AtomicRequest) -> Result<JsonValue, AtomicError> + Send + Sync + 'static,
    {
        self.operations.insert(key.into(), Box::new(operation));
        self
    }

    /// Builder form of [`LocalBackend::register`].
    pub fn with<F>(mut self, key: impl Into<String>, operation: F) -> Self
    where
        F: Fn(&AtomicRequest) -> Result<JsonValue, AtomicError> + Send + Sync + 'static,
    {
        self.register(key, operation);
        self
    }
}

impl AtomicBackend for LocalBackend {
    fn invoke(&self, request: &AtomicRequest) -> Result<JsonValue, AtomicError> {
        let operation = self
            .operations
            .get(&request.key)
            .ok_or_else(|| AtomicError::Unknown(request.key.clone()))?;
        operation(request)
    }
}

/// Forwards operations to a remote worker on the `atomic` channel.
pub struct RemoteBackend {
    transport: Transport,
}

impl RemoteBackend {
    /// Backend sending over `transport`.
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

impl AtomicBackend for RemoteBackend {
    fn invoke(&self, request: &AtomicRequest) -> Result<JsonValue, AtomicError> {
        let payload = json!({ "args": request.args, "info": request.info });
        let reply = self.transport.send_blocking(
            "atomic",
            &request.key,
            payload,
            request.timeout,
            Some(&request.cancel),
        )?;
        let ok = reply.payload.get("ok").and_then(JsonValue::as_bool).unwrap_or(false);
        if ok {
            Ok(reply.payload.get("result").cloned().unwrap_or(JsonValue::Null))
        } else {
            let message = match reply.payload.get("error") {
                Some(JsonValue::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => format!("{} failed", request.key),
            };
            Err(AtomicError::Failed(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> AtomicRequest {
        AtomicRequest {
            key: key.into(),
            args: Map::new(),
            info: json!([1, "main"]),
            timeout: Duration::from_secs(1),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn local_backend_dispatches_by_key() {
        let backend = LocalBackend::new().with("Math.answer", |_| Ok(json!(42)));
        assert_eq!(backend.invoke(&request("Math.answer")).unwrap(), json!(42));
        assert!(matches!(
            backend.invoke(&request("Math.question")),
            Err(AtomicError::Unknown(key)) if key == "Math.question"
        ));
    }
}
