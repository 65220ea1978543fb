//! Ordered rule table mapping faults onto [`FaultCategory`] values.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::category::{FaultCategory, RecoveryPolicy};
use super::classified::ClassifiedFault;
use super::context::OperationContext;
use super::kind::{Fault, FaultKind};

/// Predicate deciding whether a rule applies to a fault.
pub type FaultPredicate = Arc<dyn Fn(&dyn Fault) -> bool + Send + Sync>;

/// Error type callbacks may return; it is logged and discarded.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Observer invoked for every wrapped fault.
pub type FaultCallback = Arc<dyn Fn(&ClassifiedFault<'_>) -> Result<(), CallbackError> + Send + Sync>;

/// One entry of the classification table.
#[derive(Clone)]
pub struct ClassificationRule {
    name: String,
    predicate: FaultPredicate,
    category: FaultCategory,
}

impl ClassificationRule {
    /// Builds a rule from an arbitrary predicate.
    pub fn new(
        name: impl Into<String>,
        category: FaultCategory,
        predicate: impl Fn(&dyn Fault) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            category,
        }
    }

    /// Builds a rule matching any of the given kinds.
    pub fn for_kinds(name: impl Into<String>, category: FaultCategory, kinds: &'static [FaultKind]) -> Self {
        Self::new(name, category, move |fault| kinds.contains(&fault.kind()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn category(&self) -> FaultCategory {
        self.category
    }

    fn matches(&self, fault: &dyn Fault) -> bool {
        (self.predicate)(fault)
    }
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

/// Default rules: API faults before generic runtime faults, first match wins.
fn default_rules() -> Vec<ClassificationRule> {
    use FaultKind as K;
    vec![
        ClassificationRule::for_kinds("rate_limit", FaultCategory::RateLimit, &[K::RateLimited]),
        ClassificationRule::for_kinds("authentication", FaultCategory::Authentication, &[K::Unauthenticated]),
        ClassificationRule::for_kinds("authorization", FaultCategory::Authorization, &[K::Forbidden]),
        ClassificationRule::for_kinds("not_found", FaultCategory::NotFound, &[K::NotFound]),
        ClassificationRule::for_kinds("api", FaultCategory::Api, &[K::Api]),
        ClassificationRule::for_kinds("network", FaultCategory::Network, &[K::Connection, K::Timeout]),
        ClassificationRule::for_kinds("permission", FaultCategory::Authorization, &[K::PermissionDenied]),
        ClassificationRule::for_kinds("validation", FaultCategory::Validation, &[K::InvalidValue, K::TypeMismatch, K::Cancelled]),
        ClassificationRule::for_kinds("system", FaultCategory::System, &[K::Io, K::OutOfMemory]),
    ]
}

/// Classifies faults and produces [`ClassifiedFault`] wrappers.
///
/// Classification is a pure function of the fault: no I/O and no state
/// changes. Wrapping additionally notifies registered callbacks; a failing or
/// panicking callback is logged and otherwise ignored.
pub struct FaultClassifier {
    rules: Vec<ClassificationRule>,
    policies: HashMap<FaultCategory, RecoveryPolicy>,
    callbacks: RwLock<Vec<FaultCallback>>,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultClassifier {
    /// Creates a classifier with the default rule table and policies.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
            policies: FaultCategory::ALL
                .iter()
                .map(|&category| (category, RecoveryPolicy::for_category(category)))
                .collect(),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Adds a rule evaluated before all existing rules.
    #[must_use]
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Replaces the recovery policy for one category.
    #[must_use]
    pub fn with_policy(mut self, category: FaultCategory, policy: RecoveryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    /// Rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Maps a fault onto its category. Unmatched faults are [`FaultCategory::Unknown`].
    #[must_use]
    pub fn classify(&self, fault: &dyn Fault) -> FaultCategory {
        self.rules
            .iter()
            .find(|rule| rule.matches(fault))
            .map_or(FaultCategory::Unknown, ClassificationRule::category)
    }

    /// Returns the recovery policy configured for a category.
    #[must_use]
    pub fn policy(&self, category: FaultCategory) -> RecoveryPolicy {
        self.policies
            .get(&category)
            .copied()
            .unwrap_or_else(|| RecoveryPolicy::for_category(category))
    }

    /// Classifies a fault, builds its messages and notifies callbacks.
    pub fn wrap<'a>(&self, fault: &'a dyn Fault, context: &'a OperationContext) -> ClassifiedFault<'a> {
        let category = self.classify(fault);
        let classified = ClassifiedFault::new(fault, context, category, self.policy(category));
        self.notify(&classified);
        classified
    }

    /// Registers a callback. Registering the same callback twice is a no-op.
    pub fn add_callback(&self, callback: FaultCallback) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        if !callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            callbacks.push(callback);
        }
    }

    /// Removes a previously registered callback. Unknown callbacks are ignored.
    pub fn remove_callback(&self, callback: &FaultCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, callback));
    }

    fn notify(&self, classified: &ClassifiedFault<'_>) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(classified))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    debug!(fault_id = %classified.id(), %error, "fault callback failed");
                }
                Err(_) => {
                    warn!(fault_id = %classified.id(), "fault callback panicked");
                }
            }
        }
    }
}

impl fmt::Debug for FaultClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self
            .callbacks
            .read()
            .map_or(0, |callbacks| callbacks.len());
        f.debug_struct("FaultClassifier")
            .field("rules", &self.rules)
            .field("policies", &self.policies)
            .field("callbacks", &callbacks)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::fault::{CivitaiApiError, RecoveryStrategy};

    #[derive(Debug, thiserror::Error)]
    #[error("{0:?} fault")]
    struct Tagged(FaultKind);

    impl Fault for Tagged {
        fn kind(&self) -> FaultKind {
            self.0
        }
    }

    fn io(kind: std::io::ErrorKind) -> std::io::Error {
        std::io::Error::new(kind, "io")
    }

    #[test]
    fn test_default_classification_table() {
        let classifier = FaultClassifier::new();
        let cases = [
            (FaultKind::RateLimited, FaultCategory::RateLimit),
            (FaultKind::Unauthenticated, FaultCategory::Authentication),
            (FaultKind::Forbidden, FaultCategory::Authorization),
            (FaultKind::NotFound, FaultCategory::NotFound),
            (FaultKind::Api, FaultCategory::Api),
            (FaultKind::Connection, FaultCategory::Network),
            (FaultKind::Timeout, FaultCategory::Network),
            (FaultKind::PermissionDenied, FaultCategory::Authorization),
            (FaultKind::InvalidValue, FaultCategory::Validation),
            (FaultKind::TypeMismatch, FaultCategory::Validation),
            (FaultKind::Cancelled, FaultCategory::Validation),
            (FaultKind::Io, FaultCategory::System),
            (FaultKind::OutOfMemory, FaultCategory::System),
            (FaultKind::Other, FaultCategory::Unknown),
        ];
        for (kind, expected) in cases {
            assert_eq!(classifier.classify(&Tagged(kind)), expected, "{kind:?}");
        }
    }

    #[test]
    fn test_classify_is_idempotent() {
        let classifier = FaultClassifier::new();
        let fault = io(std::io::ErrorKind::ConnectionReset);
        let first = classifier.classify(&fault);
        let second = classifier.classify(&fault);
        assert_eq!(first, second);
        assert_eq!(first, FaultCategory::Network);
    }

    #[test]
    fn test_api_faults_win_over_generic_rules() {
        let classifier = FaultClassifier::new();
        let fault = CivitaiApiError::from_status(429, "", None);
        assert_eq!(classifier.classify(&fault), FaultCategory::RateLimit);
    }

    #[test]
    fn test_custom_rule_is_evaluated_first() {
        let classifier = FaultClassifier::new().with_rule(ClassificationRule::new(
            "disk_full_is_network",
            FaultCategory::Network,
            |fault| fault.to_string().contains("io"),
        ));
        assert_eq!(
            classifier.classify(&io(std::io::ErrorKind::Other)),
            FaultCategory::Network
        );
    }

    #[test]
    fn test_wrap_builds_messages_and_retryability() {
        let classifier = FaultClassifier::new();
        let context = OperationContext::new("search", "api").with_endpoint("/models");
        let fault = CivitaiApiError::from_status(429, "", None);

        let classified = classifier.wrap(&fault, &context);
        assert_eq!(classified.category(), FaultCategory::RateLimit);
        assert_eq!(classified.user_message(), "Too many requests. Please wait a moment.");
        assert!(classified.is_retryable());
        assert!(classified.log_message().contains("api.search"));
        assert!(classified.log_message().contains("rate_limit"));
        assert!(classified.log_message().contains("RateLimitError"));
        assert!(classified.log_message().contains("/models"));
        assert!(!classified.is_user_facing());
    }

    #[test]
    fn test_wrap_user_input_strategy_not_retryable() {
        let classifier = FaultClassifier::new();
        let context = OperationContext::new("login", "cli").user_initiated();
        let fault = CivitaiApiError::from_status(401, "bad token", None);

        let classified = classifier.wrap(&fault, &context);
        assert_eq!(classified.policy().strategy, RecoveryStrategy::UserInput);
        assert!(!classified.is_retryable());
        assert!(classified.is_user_facing());
    }

    #[test]
    fn test_policy_override() {
        let mut policy = RecoveryPolicy::for_category(FaultCategory::NotFound);
        policy.strategy = RecoveryStrategy::Fallback;
        policy.max_retries = 1;
        let classifier = FaultClassifier::new().with_policy(FaultCategory::NotFound, policy);
        assert_eq!(classifier.policy(FaultCategory::NotFound).max_retries, 1);
    }

    #[test]
    fn test_callbacks_invoked_and_failures_swallowed() {
        let classifier = FaultClassifier::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let counting: FaultCallback = Arc::new(move |_fault: &ClassifiedFault<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let failing: FaultCallback =
            Arc::new(|_fault: &ClassifiedFault<'_>| -> Result<(), CallbackError> {
                Err("sink offline".into())
            });
        let panicking: FaultCallback =
            Arc::new(|_fault: &ClassifiedFault<'_>| -> Result<(), CallbackError> {
                panic!("callback bug")
            });

        classifier.add_callback(Arc::clone(&counting));
        classifier.add_callback(Arc::clone(&counting));
        classifier.add_callback(failing);
        classifier.add_callback(panicking);

        let context = OperationContext::new("op", "svc");
        let fault = io(std::io::ErrorKind::TimedOut);
        let classified = classifier.wrap(&fault, &context);

        assert_eq!(classified.category(), FaultCategory::Network);
        assert_eq!(seen.load(Ordering::SeqCst), 1, "duplicate registration is a no-op");

        classifier.remove_callback(&counting);
        let _ = classifier.wrap(&fault, &context);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
