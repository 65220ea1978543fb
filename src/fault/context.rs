//! Operation context attached to every retried call and classified fault.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Parameter keys containing any of these fragments are never rendered.
const SECRET_KEY_FRAGMENTS: &[&str] = &["password", "token", "secret", "key", "auth", "credential"];

/// Placeholder used when rendering a redacted parameter.
const REDACTED: &str = "[redacted]";

/// Identifies what ran (or failed): operation, component and request metadata.
///
/// Built once per call with the `with_*` builder methods and never mutated
/// afterwards.
///
/// # Example
///
/// ```
/// use civitai_core::OperationContext;
///
/// let ctx = OperationContext::new("search_models", "api_client")
///     .with_endpoint("/api/v1/models")
///     .with_param("query", "anime")
///     .with_param("api_key", "hunter2");
///
/// assert_eq!(ctx.operation_key(), "api_client.search_models");
/// assert!(!ctx.to_string().contains("hunter2"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    operation: String,
    component: String,
    endpoint: Option<String>,
    parameters: BTreeMap<String, Value>,
    request_id: Option<String>,
    session_id: Option<String>,
    correlation_id: Option<String>,
    user_initiated: bool,
    timestamp: DateTime<Utc>,
}

impl OperationContext {
    /// Creates a context for `operation` running inside `component`.
    #[must_use]
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            endpoint: None,
            parameters: BTreeMap::new(),
            request_id: None,
            session_id: None,
            correlation_id: None,
            user_initiated: false,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Adds an auxiliary parameter. Secret-looking keys are kept but never rendered.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Marks the operation as triggered directly by a user (CLI, UI).
    #[must_use]
    pub fn user_initiated(mut self) -> Self {
        self.user_initiated = true;
        self
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn is_user_initiated(&self) -> bool {
        self.user_initiated
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the raw parameter value, secrets included.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Key partitioning retry history and metrics: `"{component}.{operation}"`.
    #[must_use]
    pub fn operation_key(&self) -> String {
        format!("{}.{}", self.component, self.operation)
    }

    /// Parameters safe to log: secret-looking keys are replaced with a placeholder.
    #[must_use]
    pub fn sanitized_parameters(&self) -> BTreeMap<String, Value> {
        self.parameters
            .iter()
            .map(|(key, value)| {
                if is_secret_key(key) {
                    (key.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Serializable snapshot with secrets redacted.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            operation: self.operation.clone(),
            component: self.component.clone(),
            endpoint: self.endpoint.clone(),
            parameters: self.sanitized_parameters(),
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.operation)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " [{endpoint}]")?;
        }
        let params = self.sanitized_parameters();
        if !params.is_empty() {
            let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

/// Redacted, serializable copy of an [`OperationContext`].
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub operation: String,
    pub component: String,
    pub endpoint: Option<String>,
    pub parameters: BTreeMap<String, Value>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_key_format() {
        let ctx = OperationContext::new("download", "bulk");
        assert_eq!(ctx.operation_key(), "bulk.download");
    }

    #[test]
    fn test_secrets_are_redacted_in_display_and_snapshot() {
        let ctx = OperationContext::new("fetch", "api")
            .with_param("Password", "p4ss")
            .with_param("apiToken", "t0k")
            .with_param("model_id", 42);

        let rendered = ctx.to_string();
        assert!(!rendered.contains("p4ss"));
        assert!(!rendered.contains("t0k"));
        assert!(rendered.contains("model_id=42"));

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.parameters["Password"], Value::String(REDACTED.into()));
        assert_eq!(snapshot.parameters["model_id"], Value::from(42));
    }

    #[test]
    fn test_raw_param_access_keeps_value() {
        let ctx = OperationContext::new("fetch", "api").with_param("token", "abc");
        assert_eq!(ctx.param("token"), Some(&Value::from("abc")));
    }

    #[test]
    fn test_user_initiated_flag() {
        let ctx = OperationContext::new("fetch", "cli");
        assert!(!ctx.is_user_initiated());
        assert!(ctx.user_initiated().is_user_initiated());
    }
}
