//! The [`ClassifiedFault`] wrapper produced by [`FaultClassifier::wrap`](super::FaultClassifier::wrap).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::category::{FaultCategory, RecoveryPolicy, RecoveryStrategy};
use super::context::{ContextSnapshot, OperationContext};
use super::kind::Fault;

/// One raised fault together with its classification and generated messages.
///
/// The wrapper only borrows the original fault and its context; it never owns
/// or alters them. Once dropped, the retry loop can hand the original fault
/// back to the caller untouched.
pub struct ClassifiedFault<'a> {
    id: Uuid,
    source: &'a dyn Fault,
    context: &'a OperationContext,
    category: FaultCategory,
    policy: RecoveryPolicy,
    user_message: String,
    log_message: String,
    suggested_action: String,
    timestamp: DateTime<Utc>,
}

impl<'a> ClassifiedFault<'a> {
    pub(crate) fn new(
        source: &'a dyn Fault,
        context: &'a OperationContext,
        category: FaultCategory,
        policy: RecoveryPolicy,
    ) -> Self {
        let user_message = category.user_message().to_string();
        let log_message = build_log_message(source, context, category);
        let suggested_action = match source.retry_after() {
            Some(wait) if category == FaultCategory::RateLimit => format!(
                "{} Server asked to retry after {}s.",
                category.suggested_action(),
                wait.as_secs()
            ),
            _ => category.suggested_action().to_string(),
        };

        Self {
            id: Uuid::new_v4(),
            source,
            context,
            category,
            policy,
            user_message,
            log_message,
            suggested_action,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The original fault, exactly as raised.
    #[must_use]
    pub fn source(&self) -> &'a dyn Fault {
        self.source
    }

    #[must_use]
    pub fn context(&self) -> &'a OperationContext {
        self.context
    }

    #[must_use]
    pub fn category(&self) -> FaultCategory {
        self.category
    }

    #[must_use]
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    #[must_use]
    pub fn log_message(&self) -> &str {
        &self.log_message
    }

    #[must_use]
    pub fn suggested_action(&self) -> &str {
        &self.suggested_action
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Short stable name of the original fault type.
    #[must_use]
    pub fn fault_name(&self) -> &'static str {
        self.source.fault_name()
    }

    /// True iff the recovery strategy is retry or fallback.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.policy.strategy.is_retryable()
    }

    /// True when the failing operation was triggered directly by a user.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        self.context.is_user_initiated()
    }

    /// Owned, serializable summary for reports. Secrets in the context are redacted.
    #[must_use]
    pub fn summary(&self) -> FaultSummary {
        FaultSummary {
            id: self.id,
            fault_name: self.fault_name().to_string(),
            message: self.source.to_string(),
            category: self.category,
            strategy: self.policy.strategy,
            retryable: self.is_retryable(),
            user_facing: self.is_user_facing(),
            user_message: self.user_message.clone(),
            suggested_action: self.suggested_action.clone(),
            context: self.context.snapshot(),
            timestamp: self.timestamp,
        }
    }
}

impl fmt::Debug for ClassifiedFault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedFault")
            .field("id", &self.id)
            .field("fault", &self.fault_name())
            .field("category", &self.category)
            .field("strategy", &self.policy.strategy)
            .field("context", &self.context.operation_key())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ClassifiedFault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_message)
    }
}

/// Serializable record of a classified fault.
#[derive(Debug, Clone, Serialize)]
pub struct FaultSummary {
    pub id: Uuid,
    pub fault_name: String,
    pub message: String,
    pub category: FaultCategory,
    pub strategy: RecoveryStrategy,
    pub retryable: bool,
    pub user_facing: bool,
    pub user_message: String,
    pub suggested_action: String,
    pub context: ContextSnapshot,
    pub timestamp: DateTime<Utc>,
}

fn build_log_message(source: &dyn Fault, context: &OperationContext, category: FaultCategory) -> String {
    let mut message = format!(
        "{}.{} failed [{}] {}: {}",
        context.component(),
        context.operation(),
        category,
        source.fault_name(),
        source
    );
    if let Some(endpoint) = context.endpoint() {
        message.push_str(&format!(" (endpoint: {endpoint})"));
    }
    if let Some(request_id) = context.request_id() {
        message.push_str(&format!(" (request: {request_id})"));
    }
    message
}
