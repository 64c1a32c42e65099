//! ## skansen-telemetry::metrics
//! **Prometheus registry for sync cycles, drift repairs and table writes**

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::TelemetryError;

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub sync_cycles: IntCounterVec,
    pub drift_repairs: IntCounterVec,
    pub table_writes: IntCounterVec,
    pub generation: IntGaugeVec,
    pub sync_duration: Histogram,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let sync_cycles = IntCounterVec::new(
            Opts::new("skansen_sync_cycles_total", "Sync cycles by mode and outcome"),
            &["interface", "mode", "outcome"],
        )?;
        let drift_repairs = IntCounterVec::new(
            Opts::new(
                "skansen_drift_repairs_total",
                "Externally introduced drift corrected by a sync cycle",
            ),
            &["interface", "kind"],
        )?;
        let table_writes = IntCounterVec::new(
            Opts::new("skansen_table_writes_total", "Block table writes"),
            &["interface", "op"],
        )?;
        let generation = IntGaugeVec::new(
            Opts::new("skansen_generation", "Last successfully applied generation"),
            &["interface"],
        )?;
        let sync_duration = Histogram::with_opts(
            HistogramOpts::new("skansen_sync_duration_seconds", "Sync cycle duration")
                .buckets(vec![0.001, 0.005, 0.025, 0.1, 0.5, 2.0]),
        )?;

        registry.register(Box::new(sync_cycles.clone()))?;
        registry.register(Box::new(drift_repairs.clone()))?;
        registry.register(Box::new(table_writes.clone()))?;
        registry.register(Box::new(generation.clone()))?;
        registry.register(Box::new(sync_duration.clone()))?;

        Ok(Self {
            registry,
            sync_cycles,
            drift_repairs,
            table_writes,
            generation,
            sync_duration,
        })
    }

    pub fn gather_metrics(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn record_cycle(&self, interface: &str, mode: &str, outcome: &str, seconds: f64) {
        self.sync_cycles
            .with_label_values(&[interface, mode, outcome])
            .inc();
        self.sync_duration.observe(seconds);
    }

    pub fn record_drift(&self, interface: &str, kind: &str) {
        self.drift_repairs.with_label_values(&[interface, kind]).inc();
    }

    pub fn record_writes(&self, interface: &str, op: &str, count: usize) {
        if count > 0 {
            self.table_writes
                .with_label_values(&[interface, op])
                .inc_by(count as u64);
        }
    }

    pub fn set_generation(&self, interface: &str, generation: u64) {
        self.generation
            .with_label_values(&[interface])
            .set(i64::try_from(generation).unwrap_or(i64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_labels() {
        let metrics = MetricsRecorder::new().unwrap();
        metrics.record_cycle("eth0", "resync", "ok", 0.002);
        metrics.record_drift("eth0", "entry_missing");
        metrics.record_writes("eth0", "insert", 3);
        metrics.set_generation("eth0", 7);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains(
            "skansen_sync_cycles_total{interface=\"eth0\",mode=\"resync\",outcome=\"ok\"} 1"
        ));
        assert!(text.contains("skansen_table_writes_total{interface=\"eth0\",op=\"insert\"} 3"));
        assert!(text.contains("skansen_generation{interface=\"eth0\"} 7"));
        assert!(text.contains("skansen_drift_repairs_total"));
    }

    #[test]
    fn zero_writes_are_not_recorded() {
        let metrics = MetricsRecorder::new().unwrap();
        metrics.record_writes("eth0", "remove", 0);
        let text = metrics.gather_metrics().unwrap();
        assert!(!text.contains("op=\"remove\""));
    }
}
