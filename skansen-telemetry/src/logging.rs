//! ## skansen-telemetry::logging
//! **Structured logging with tracing and OpenTelemetry key/values**
//!
//! `EventLogger::init` installs the global subscriber. `RUST_LOG` wins over the
//! configured level. Enforcement events operators care about (drift repaired,
//! foreign program replaced, hook unsupported) go through `log_event` so they
//! share one span name and can be filtered as a group.

use opentelemetry::KeyValue;
use tracing::{info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use crate::TelemetryError;

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    pub fn init(default_level: &str, json: bool) -> Result<(), TelemetryError> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let builder = fmt().with_env_filter(filter).with_thread_names(true);
        let installed = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        installed.map_err(|e| TelemetryError::Init(e.to_string()))
    }

    pub async fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "enforcement_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );

        async {
            tracing::warn!(
                metadata = ?metadata,
                "Enforcement event"
            );
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logging() {
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(EventLogger::log_event(
                "drift_repaired",
                vec![KeyValue::new("interface", "eth0")],
            ));
        assert!(logs_contain("Enforcement event"));
        assert!(logs_contain("eth0"));
    }
}
