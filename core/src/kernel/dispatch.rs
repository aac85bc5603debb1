//! Subscriber table and fan-out
//!
//! Subscriptions are by exact type or by a prefix pattern ending in `.*`.
//! Fan-out invokes exact subscribers first, then wildcard subscribers, each
//! group in registration order. A faulting handler never interrupts
//! delivery to the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::KernelError;

use super::envelope::EventEnvelope;

/// Subscriber capability record
pub type EventHandler = Box<dyn FnMut(&EventEnvelope) -> anyhow::Result<()> + Send>;

/// Handle returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

/// `a.b.*` matches `a.b`, `a.b.c`, `a.b.c.d`; anything else is exact
pub fn type_matches(pattern: &str, event_type: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => {
            event_type == prefix
                || event_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
        }
        None => pattern == event_type,
    }
}

/// Reject empty patterns, empty segments, and `*` anywhere but a trailing `.*`
pub fn validate_pattern(pattern: &str) -> Result<(), KernelError> {
    let exact_part = pattern.strip_suffix(".*").unwrap_or(pattern);
    let valid = !exact_part.is_empty()
        && !exact_part.contains('*')
        && exact_part.split('.').all(|segment| !segment.is_empty());
    if valid {
        Ok(())
    } else {
        Err(KernelError::Validation {
            message: format!("invalid type pattern: {:?}", pattern),
        })
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    wildcard: bool,
    handler: EventHandler,
}

/// A handler fault surfaced from one fan-out step
#[derive(Debug)]
pub struct HandlerFault {
    pub subscription_id: SubscriptionId,
    pub pattern: String,
    pub detail: String,
}

/// Result of one fan-out step
#[derive(Debug, Default)]
pub struct FanOut {
    pub invoked: usize,
    pub faults: Vec<HandlerFault>,
}

/// Registration-ordered subscriber table
#[derive(Default)]
pub struct SubscriberTable {
    subscriptions: Vec<Subscription>,
    next_id: SubscriptionId,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        pattern: impl Into<String>,
        handler: EventHandler,
    ) -> Result<SubscriptionId, KernelError> {
        let pattern = pattern.into();
        validate_pattern(&pattern)?;
        self.next_id += 1;
        let id = self.next_id;
        self.subscriptions.push(Subscription {
            id,
            wildcard: pattern.ends_with(".*"),
            pattern,
            handler,
        });
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    /// Deliver to every matching subscriber: exact first, then wildcard,
    /// registration order within each group. Faults are collected, never
    /// raised.
    pub fn dispatch(&mut self, envelope: &EventEnvelope) -> FanOut {
        let mut result = FanOut::default();
        for wildcard_pass in [false, true] {
            for sub in self
                .subscriptions
                .iter_mut()
                .filter(|s| s.wildcard == wildcard_pass)
            {
                if !type_matches(&sub.pattern, &envelope.event_type) {
                    continue;
                }
                result.invoked += 1;
                let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(envelope)));
                let detail = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err.to_string(),
                    Err(panic) => panic_detail(panic),
                };
                result.faults.push(HandlerFault {
                    subscription_id: sub.id,
                    pattern: sub.pattern.clone(),
                    detail,
                });
            }
        }
        result
    }
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::Map;

    use super::*;

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: "e1".to_string(),
            correlation_id: "c1".to_string(),
            causation_id: None,
            event_type: event_type.to_string(),
            source: "test".to_string(),
            recipient_id: "p1".to_string(),
            timestamp: 0,
            sequence: 1,
            payload: Map::new(),
            skipped: None,
        }
    }

    #[test]
    fn test_type_matching() {
        assert!(type_matches("a.b", "a.b"));
        assert!(!type_matches("a.b", "a.b.c"));
        assert!(type_matches("a.b.*", "a.b"));
        assert!(type_matches("a.b.*", "a.b.c"));
        assert!(type_matches("a.b.*", "a.b.c.d"));
        assert!(!type_matches("a.b.*", "a.bc"));
        assert!(!type_matches("a.b.*", "a"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(validate_pattern("inject.requested").is_ok());
        assert!(validate_pattern("inject.*").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("*").is_err());
        assert!(validate_pattern("a..b").is_err());
        assert!(validate_pattern("a.*.b").is_err());
    }

    #[test]
    fn test_exact_before_wildcard_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut table = SubscriberTable::new();

        for (pattern, tag) in [
            ("inject.*", "w1"),
            ("inject.requested", "e1"),
            ("inject.*", "w2"),
            ("inject.requested", "e2"),
        ] {
            let order = Arc::clone(&order);
            table
                .subscribe(pattern, Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }))
                .unwrap();
        }

        let result = table.dispatch(&envelope("inject.requested"));
        assert_eq!(result.invoked, 4);
        assert_eq!(*order.lock().unwrap(), vec!["e1", "e2", "w1", "w2"]);
    }

    #[test]
    fn test_faulting_handler_does_not_stop_fanout() {
        let hits = Arc::new(Mutex::new(0));
        let mut table = SubscriberTable::new();

        table
            .subscribe("inject.requested", Box::new(|_| anyhow::bail!("boom")))
            .unwrap();
        {
            let hits = Arc::clone(&hits);
            table
                .subscribe("inject.requested", Box::new(move |_| {
                    *hits.lock().unwrap() += 1;
                    Ok(())
                }))
                .unwrap();
        }
        table
            .subscribe("inject.*", Box::new(|_| panic!("handler exploded")))
            .unwrap();
        {
            let hits = Arc::clone(&hits);
            table
                .subscribe("inject.*", Box::new(move |_| {
                    *hits.lock().unwrap() += 1;
                    Ok(())
                }))
                .unwrap();
        }

        let result = table.dispatch(&envelope("inject.requested"));
        assert_eq!(result.invoked, 4);
        assert_eq!(result.faults.len(), 2);
        assert_eq!(*hits.lock().unwrap(), 2);
        assert!(result.faults[1].detail.contains("handler exploded"));
    }

    #[test]
    fn test_unsubscribe() {
        let mut table = SubscriberTable::new();
        let id = table.subscribe("a.b", Box::new(|_| Ok(()))).unwrap();
        assert!(table.unsubscribe(id));
        assert!(!table.unsubscribe(id));
        let result = table.dispatch(&envelope("a.b"));
        assert_eq!(result.invoked, 0);
    }
}
