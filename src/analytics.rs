//! Structured analytics events.
//!
//! The sink is fire-and-forget: recording can never fail or block a request,
//! so the trait is infallible and the default implementation emits a tracing
//! event on a dedicated target for downstream collection.

use serde_json::Value;
use tracing::info;

pub const SAML_AUTH: &str = "saml_auth";
pub const LOGOUT_INITIATED: &str = "logout_initiated";
pub const PERSONAL_KEY_REACTIVATION: &str = "personal_key_reactivation";

pub trait Analytics: Send + Sync {
    fn record(&self, event: &str, attributes: Value);
}

/// Emits analytics events as structured tracing records.
#[derive(Clone, Debug, Default)]
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn record(&self, event: &str, attributes: Value) {
        info!(target: "analytics", event, attributes = %attributes);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use serde_json::Value;

    use super::Analytics;

    /// Captures events so tests can assert on count and payload.
    #[derive(Default)]
    pub(crate) struct CapturingAnalytics {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl CapturingAnalytics {
        pub(crate) fn events(&self) -> Vec<(String, Value)> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    impl Analytics for CapturingAnalytics {
        fn record(&self, event: &str, attributes: Value) {
            if let Ok(mut events) = self.events.lock() {
                events.push((event.to_string(), attributes));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::CapturingAnalytics;
    use super::{Analytics, TracingAnalytics};

    #[test]
    fn tracing_sink_never_panics() {
        TracingAnalytics.record(super::SAML_AUTH, json!({"issuer": "sp-a"}));
    }

    #[test]
    fn capturing_sink_records_in_order() {
        let sink = CapturingAnalytics::default();
        sink.record("first", json!({}));
        sink.record("second", json!({"n": 2}));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "first");
        assert_eq!(events[1].1, json!({"n": 2}));
    }
}
