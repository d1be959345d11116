use once_cell::sync::{Lazy, OnceCell};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
static SERVICE_NAME: OnceCell<&'static str> = OnceCell::new();
static PROCESS_START: OnceCell<Instant> = OnceCell::new();

pub(crate) fn init(service: &str) {
    if SERVICE_NAME.get().is_some() {
        return;
    }

    let leaked = Box::leak(service.to_string().into_boxed_str());
    SERVICE_NAME.set(leaked).ok();
    PROCESS_START.get_or_init(Instant::now);
    http_requests_total().ensure(&[leaked, "/metrics", "200"]);
}

pub fn service_name() -> Option<&'static str> {
    SERVICE_NAME.get().copied()
}

#[derive(Default)]
struct Registry {
    counters: RwLock<Vec<Arc<CounterVecInner>>>,
}

impl Registry {
    fn register(&self, counter: Arc<CounterVecInner>) -> Arc<CounterVecInner> {
        let mut guard = self.counters.write().expect("lock poisoned");
        if let Some(existing) = guard.iter().find(|existing| existing.name == counter.name) {
            return existing.clone();
        }
        guard.push(counter.clone());
        counter
    }

    fn encode(&self) -> String {
        let mut output = String::new();

        if let Some(start) = PROCESS_START.get() {
            let service = service_name().unwrap_or("unknown");
            let _ = writeln!(
                output,
                "# HELP process_uptime_seconds Service uptime in seconds"
            );
            let _ = writeln!(output, "# TYPE process_uptime_seconds gauge");
            let _ = writeln!(
                output,
                "process_uptime_seconds{{service=\"{}\"}} {:.3}",
                escape_label_value(service),
                start.elapsed().as_secs_f64()
            );
        }

        let guard = self.counters.read().expect("lock poisoned");
        for counter in guard.iter() {
            let _ = writeln!(output, "# HELP {} {}", counter.name, counter.help);
            let _ = writeln!(output, "# TYPE {} counter", counter.name);
            let samples = counter.values.lock().expect("lock poisoned");
            for (labels, value) in samples.iter() {
                output.push_str(counter.name);
                write_labels(&mut output, counter.label_names, labels);
                let _ = writeln!(output, " {}", value.load(Ordering::Relaxed));
            }
        }

        output
    }
}

struct CounterVecInner {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    values: Mutex<BTreeMap<Vec<String>, Arc<AtomicU64>>>,
}

impl CounterVecInner {
    fn slot(&self, labels: &[&str]) -> Arc<AtomicU64> {
        debug_assert_eq!(labels.len(), self.label_names.len(), "label arity mismatch");
        let key: Vec<String> = labels.iter().map(|label| label.to_string()).collect();
        let mut values = self.values.lock().expect("lock poisoned");
        values.entry(key).or_default().clone()
    }
}

/// A labelled family of monotonically increasing counters.
#[derive(Clone)]
pub struct CounterVec {
    inner: Arc<CounterVecInner>,
}

impl CounterVec {
    pub fn with_label_values(&self, labels: &[&str]) -> Counter {
        Counter {
            value: self.inner.slot(labels),
        }
    }

    pub fn inc(&self, labels: &[&str], amount: u64) {
        self.with_label_values(labels).inc(amount);
    }

    /// Make the series visible in the exposition before it is first incremented.
    pub fn ensure(&self, labels: &[&str]) {
        self.inner.slot(labels);
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        self.with_label_values(labels).get()
    }
}

#[derive(Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Register (or fetch the already registered) counter family called `name`.
pub fn register_counter(
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
) -> CounterVec {
    let inner = REGISTRY.register(Arc::new(CounterVecInner {
        name,
        help,
        label_names,
        values: Mutex::new(BTreeMap::new()),
    }));
    CounterVec { inner }
}

pub fn encode_prometheus() -> String {
    REGISTRY.encode()
}

static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter(
        "http_requests_total",
        "Total HTTP requests handled",
        &["service", "route", "code"],
    )
});

pub fn http_requests_total() -> &'static CounterVec {
    &HTTP_REQUESTS_TOTAL
}

fn write_labels(output: &mut String, names: &[&str], values: &[String]) {
    if names.is_empty() {
        return;
    }
    output.push('{');
    for (idx, (name, value)) in names.iter().zip(values).enumerate() {
        if idx > 0 {
            output.push(',');
        }
        let _ = write!(output, "{}=\"{}\"", name, escape_label_value(value));
    }
    output.push('}');
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_by_name() {
        let first = register_counter("test_shared_total", "shared", &["kind"]);
        let second = register_counter("test_shared_total", "shared", &["kind"]);
        first.inc(&["a"], 2);
        second.inc(&["a"], 1);
        assert_eq!(first.get(&["a"]), 3);
    }

    #[test]
    fn encodes_labels_in_order() {
        let counter = register_counter("test_encode_total", "encode", &["check", "status"]);
        counter.inc(&["token", "AUTHORIZED"], 1);
        counter.ensure(&["session", "UNAUTHORIZED"]);

        let encoded = encode_prometheus();
        assert!(encoded.contains("# TYPE test_encode_total counter"));
        assert!(encoded.contains("test_encode_total{check=\"token\",status=\"AUTHORIZED\"} 1"));
        assert!(encoded.contains("test_encode_total{check=\"session\",status=\"UNAUTHORIZED\"} 0"));
    }

    #[test]
    fn escapes_label_values() {
        assert_eq!(escape_label_value("a\"b\\c"), "a\\\"b\\\\c");
    }
}
