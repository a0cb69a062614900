//! Translation metrics using metrics-rs.
//!
//! The orchestrator records through the `metrics` facade; the CLI installs
//! [`CliRecorder`] to print a summary when `--metrics` is given.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit, counter,
    describe_counter, describe_histogram, histogram,
};
use parking_lot::RwLock;

use crate::compile::CompiledUnit;

// ============================================================================
// Metric descriptions
// ============================================================================

/// Register metric descriptions. Call once at startup.
pub fn init() {
    describe_counter!(
        "a32t_units_compiled_total",
        Unit::Count,
        "Compilation units translated"
    );
    describe_counter!(
        "a32t_fixups_resolved_total",
        Unit::Count,
        "Pending fixups resolved"
    );
    describe_counter!(
        "a32t_trampolines_total",
        Unit::Count,
        "Out-of-line exit trampolines and long branches emitted"
    );
    describe_counter!(
        "a32t_host_words_total",
        Unit::Count,
        "Host instruction words emitted"
    );
    describe_counter!(
        "a32t_units_failed_total",
        Unit::Count,
        "Units that failed to translate"
    );
    describe_histogram!(
        "a32t_unit_expansion_ratio",
        Unit::Count,
        "Host words per guest instruction word"
    );
}

// ============================================================================
// Metric recording functions
// ============================================================================

/// Record one finished unit.
pub fn record_unit(unit: &CompiledUnit) {
    let stats = &unit.stats.resolve;
    counter!("a32t_units_compiled_total").increment(1);
    counter!("a32t_fixups_resolved_total").increment(stats.fixups as u64);
    counter!("a32t_trampolines_total").increment((stats.trampolines + stats.long_branches) as u64);
    counter!("a32t_host_words_total").increment(unit.code.len() as u64);
    let guest_words = unit.guest_bytes / 4;
    if guest_words > 0 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = unit.code.len() as f64 / f64::from(guest_words);
        histogram!("a32t_unit_expansion_ratio").record(ratio);
    }
}

/// Record a unit that failed to translate.
pub fn record_failure(reason: &'static str) {
    counter!("a32t_units_failed_total", "reason" => reason).increment(1);
}

// ============================================================================
// CLI Recorder for terminal output
// ============================================================================

#[derive(Default)]
struct CounterStorage {
    values: RwLock<HashMap<String, u64>>,
}

#[derive(Default)]
struct HistogramStorage {
    values: RwLock<HashMap<String, Vec<f64>>>,
}

struct CliCounter {
    key: String,
    storage: Arc<CounterStorage>,
}

impl metrics::CounterFn for CliCounter {
    fn increment(&self, value: u64) {
        let mut values = self.storage.values.write();
        *values.entry(self.key.clone()).or_insert(0) += value;
    }

    fn absolute(&self, value: u64) {
        let mut values = self.storage.values.write();
        values.insert(self.key.clone(), value);
    }
}

struct CliHistogram {
    key: String,
    storage: Arc<HistogramStorage>,
}

impl metrics::HistogramFn for CliHistogram {
    fn record(&self, value: f64) {
        let mut values = self.storage.values.write();
        values.entry(self.key.clone()).or_default().push(value);
    }
}

/// In-memory recorder for CLI output. Gauges are not used by the translator
/// and are dropped.
pub struct CliRecorder {
    counters: Arc<CounterStorage>,
    histograms: Arc<HistogramStorage>,
}

impl CliRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Arc::new(CounterStorage::default()),
            histograms: Arc::new(HistogramStorage::default()),
        }
    }

    /// Install as the global recorder. Returns `None` if one is already set.
    #[must_use]
    pub fn install(self) -> Option<CliRecorderHandle> {
        let counters = Arc::clone(&self.counters);
        let histograms = Arc::clone(&self.histograms);
        metrics::set_global_recorder(self).ok()?;
        Some(CliRecorderHandle {
            counters,
            histograms,
        })
    }
}

impl Default for CliRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn key_to_string(key: &Key) -> String {
    let name = key.name();
    let labels = key.labels();
    if labels.len() == 0 {
        name.to_string()
    } else {
        let label_str: Vec<String> = labels.map(|l| format!("{}={}", l.key(), l.value())).collect();
        format!("{}{{{}}}", name, label_str.join(","))
    }
}

impl Recorder for CliRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CliCounter {
            key: key_to_string(key),
            storage: Arc::clone(&self.counters),
        }))
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(CliHistogram {
            key: key_to_string(key),
            storage: Arc::clone(&self.histograms),
        }))
    }
}

/// Read access to what [`CliRecorder`] collected.
pub struct CliRecorderHandle {
    counters: Arc<CounterStorage>,
    histograms: Arc<HistogramStorage>,
}

impl CliRecorderHandle {
    #[must_use]
    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.counters.values.read().get(key).copied()
    }

    /// Print all collected metrics.
    pub fn print_summary(&self) {
        let counters = self.counters.values.read();
        let histograms = self.histograms.values.read();

        if counters.is_empty() && histograms.is_empty() {
            println!("No metrics collected.");
            return;
        }

        println!();
        println!("## Metrics Summary");
        println!();

        if !counters.is_empty() {
            println!("### Counters");
            let mut keys: Vec<_> = counters.keys().collect();
            keys.sort();
            for key in keys {
                println!("  {}: {}", key, counters[key]);
            }
            println!();
        }

        if !histograms.is_empty() {
            println!("### Histograms");
            let mut keys: Vec<_> = histograms.keys().collect();
            keys.sort();
            for key in keys {
                let values = &histograms[key];
                if values.is_empty() {
                    continue;
                }
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                #[allow(clippy::cast_precision_loss)]
                let avg = values.iter().sum::<f64>() / values.len() as f64;
                println!(
                    "  {}: count={}, min={:.3}, max={:.3}, avg={:.3}",
                    key,
                    values.len(),
                    min,
                    max,
                    avg
                );
            }
            println!();
        }
    }
}
