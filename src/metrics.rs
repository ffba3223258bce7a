//! In-process metrics registry rendered in Prometheus text format.
//!
//! Counters are keyed by `(name, labels)`; histograms keep a bounded ring
//! of recent samples and are bucketed at render time.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

const MAX_SAMPLES: usize = 4096;
const BUCKETS_SECONDS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

type SeriesKey = (&'static str, String);

#[derive(Default)]
struct Series {
    samples: Vec<f64>,
    next: usize,
    count: u64,
    sum: f64,
}

impl Series {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(value);
        } else {
            self.samples[self.next] = value;
            self.next = (self.next + 1) % MAX_SAMPLES;
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    histograms: Mutex<BTreeMap<SeriesKey, Series>>,
}

fn label_string(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str, labels: &[(&str, &str)]) {
        let key = (name, label_string(labels));
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(key).or_insert(0) += 1;
        }
    }

    pub fn observe(&self, name: &'static str, labels: &[(&str, &str)], elapsed: Duration) {
        let key = (name, label_string(labels));
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms.entry(key).or_default().push(elapsed.as_secs_f64());
        }
    }

    /// Current value of a counter; 0 if it was never incremented.
    pub fn counter(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        let key = (name, label_string(labels));
        self.counters
            .lock()
            .map(|c| c.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of observations recorded for a histogram series.
    pub fn observations(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        let key = (name, label_string(labels));
        self.histograms
            .lock()
            .map(|h| h.get(&key).map(|s| s.count).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut body = String::new();

        if let Ok(counters) = self.counters.lock() {
            let mut last_name = "";
            for ((name, labels), value) in counters.iter() {
                if *name != last_name {
                    let _ = writeln!(body, "# TYPE {} counter", name);
                    last_name = *name;
                }
                if labels.is_empty() {
                    let _ = writeln!(body, "{} {}", name, value);
                } else {
                    let _ = writeln!(body, "{}{{{}}} {}", name, labels, value);
                }
            }
        }

        if let Ok(histograms) = self.histograms.lock() {
            let mut last_name = "";
            for ((name, labels), series) in histograms.iter() {
                if *name != last_name {
                    let _ = writeln!(body, "# TYPE {} histogram", name);
                    last_name = *name;
                }
                push_histogram(&mut body, name, labels, series);
            }
        }

        body
    }
}

fn push_histogram(body: &mut String, name: &str, labels: &str, series: &Series) {
    let sep = if labels.is_empty() { "" } else { "," };
    // Buckets come from the retained window; sum and count are lifetime totals.
    for bound in BUCKETS_SECONDS {
        let within = series.samples.iter().filter(|s| **s <= bound).count();
        let _ = writeln!(
            body,
            "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {within}"
        );
    }
    let _ = writeln!(
        body,
        "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {}",
        series.samples.len()
    );
    if labels.is_empty() {
        let _ = writeln!(body, "{name}_sum {:.9}", series.sum);
        let _ = writeln!(body, "{name}_count {}", series.count);
    } else {
        let _ = writeln!(body, "{name}_sum{{{labels}}} {:.9}", series.sum);
        let _ = writeln!(body, "{name}_count{{{labels}}} {}", series.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = Metrics::new();
        m.incr("ocr_requests_total", &[("model", "a")]);
        m.incr("ocr_requests_total", &[("model", "a")]);
        m.incr("ocr_requests_total", &[("model", "b")]);
        assert_eq!(m.counter("ocr_requests_total", &[("model", "a")]), 2);
        assert_eq!(m.counter("ocr_requests_total", &[("model", "b")]), 1);
        assert_eq!(m.counter("ocr_requests_total", &[("model", "c")]), 0);
    }

    #[test]
    fn render_emits_prometheus_text() {
        let m = Metrics::new();
        m.incr("ocr_cache_hits_total", &[]);
        m.observe(
            "ocr_request_duration_seconds",
            &[("model", "q")],
            Duration::from_millis(300),
        );
        let text = m.render();
        assert!(text.contains("# TYPE ocr_cache_hits_total counter"));
        assert!(text.contains("ocr_cache_hits_total 1"));
        assert!(text.contains("ocr_request_duration_seconds_bucket{model=\"q\",le=\"0.25\"} 0"));
        assert!(text.contains("ocr_request_duration_seconds_bucket{model=\"q\",le=\"0.5\"} 1"));
        assert!(text.contains("ocr_request_duration_seconds_count{model=\"q\"} 1"));
    }

    #[test]
    fn histogram_window_is_bounded() {
        let m = Metrics::new();
        for _ in 0..(MAX_SAMPLES + 10) {
            m.observe("h", &[], Duration::from_millis(1));
        }
        assert_eq!(m.observations("h", &[]), (MAX_SAMPLES + 10) as u64);
        let text = m.render();
        assert!(text.contains(&format!("h_bucket{{le=\"+Inf\"}} {}", MAX_SAMPLES)));
    }
}
