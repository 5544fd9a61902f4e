//! Service collaborator boundary.
//!
//! The object exposed by a server is opaque to the broker: it is invoked by
//! method name with positional JSON parameters, and it receives an
//! [`EventHub`] through which it can raise events to subscribers.

use std::collections::HashMap;

use remoting_common::protocol::Value;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::broker::EventHub;

/// Failure reported by a service method.
///
/// Formatted as `"{kind} {message}"` into the reply's `error_message`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} {message}")]
pub struct ServiceError {
    pub kind: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new("NoSuchMethod", format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("IllegalArgument", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("Internal", message)
    }
}

/// An object whose methods can be invoked remotely.
///
/// `invoke` runs on a blocking worker thread, so implementations may block.
pub trait Service: Send + Sync + 'static {
    fn invoke(&self, method: &str, parameters: Vec<Value>) -> Result<Value, ServiceError>;

    /// Called once at registration with the hub used to raise events.
    fn bind_events(&self, _hub: EventHub) {}
}

/// Reads and deserializes the parameter at `index`.
pub fn param<T: DeserializeOwned>(parameters: &[Value], index: usize) -> Result<T, ServiceError> {
    let value = parameters
        .get(index)
        .cloned()
        .ok_or_else(|| ServiceError::invalid_params(format!("Missing parameter {}", index)))?;
    serde_json::from_value(value)
        .map_err(|e| ServiceError::invalid_params(format!("Parameter {}: {}", index, e)))
}

type Method = Box<dyn Fn(Vec<Value>) -> Result<Value, ServiceError> + Send + Sync>;
type BindHook = Box<dyn Fn(EventHub) + Send + Sync>;

/// A [`Service`] assembled from named closures.
///
/// # Example
///
/// ```rust
/// use remoting_server::{param, MethodRouter, Service};
/// use serde_json::json;
///
/// let router = MethodRouter::new()
///     .method("add", |params| {
///         let a: i64 = param(&params, 0)?;
///         let b: i64 = param(&params, 1)?;
///         Ok(json!(a + b))
///     });
///
/// assert_eq!(router.invoke("add", vec![json!(1), json!(2)]).unwrap(), json!(3));
/// ```
#[derive(Default)]
pub struct MethodRouter {
    methods: HashMap<String, Method>,
    bind_hook: Option<BindHook>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method, replacing any previous one with the same name.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    /// Receives the event hub at registration.
    pub fn on_bind<F>(mut self, f: F) -> Self
    where
        F: Fn(EventHub) + Send + Sync + 'static,
    {
        self.bind_hook = Some(Box::new(f));
        self
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Service for MethodRouter {
    fn invoke(&self, method: &str, parameters: Vec<Value>) -> Result<Value, ServiceError> {
        match self.methods.get(method) {
            Some(f) => f(parameters),
            None => Err(ServiceError::method_not_found(method)),
        }
    }

    fn bind_events(&self, hub: EventHub) {
        if let Some(hook) = &self.bind_hook {
            hook(hub);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_error_format() {
        let err = ServiceError::new("IllegalState", "not ready");
        assert_eq!(err.to_string(), "IllegalState not ready");
    }

    #[test]
    fn test_router_dispatch_and_missing_method() {
        let router = MethodRouter::new()
            .method("echo", |params| Ok(params.into_iter().next().unwrap_or(Value::Null)));

        assert_eq!(router.invoke("echo", vec![json!("x")]).unwrap(), json!("x"));
        let err = router.invoke("nope", vec![]).unwrap_err();
        assert_eq!(err.kind, "NoSuchMethod");
        assert_eq!(router.method_names(), vec!["echo"]);
    }

    #[test]
    fn test_param_errors() {
        let params = vec![json!("not a number")];
        let missing = param::<i64>(&params, 1).unwrap_err();
        assert_eq!(missing.kind, "IllegalArgument");
        assert!(missing.message.contains("Missing parameter 1"));

        let wrong = param::<i64>(&params, 0).unwrap_err();
        assert_eq!(wrong.kind, "IllegalArgument");
    }
}
