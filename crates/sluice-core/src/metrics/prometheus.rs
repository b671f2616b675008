//! Client metrics with Prometheus text export.

use crate::error::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for insert duration.
/// Converts to seconds: [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
const INSERT_DURATION_BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Metrics shared by a service client and all of its channels.
pub struct ClientMetrics {
    // === COUNTERS ===
    /// Successful insert calls
    inserts_total: AtomicU64,

    /// Rows accepted by successful inserts
    rows_inserted_total: AtomicU64,

    /// Encrypted bytes uploaded to the stage
    bytes_uploaded_total: AtomicU64,

    /// Upload attempts beyond the first
    upload_retries_total: AtomicU64,

    /// Channel status polls issued while waiting for commits
    commit_polls_total: AtomicU64,

    /// Commit waits that observed the persisted row sequencer
    commits_confirmed_total: AtomicU64,

    refreshes_succeeded_total: AtomicU64,
    refreshes_failed_total: AtomicU64,

    /// Failed public operations, indexed like `ErrorKind::ALL`
    errors: [AtomicU64; ErrorKind::ALL.len()],

    // === GAUGES ===
    /// Channels opened and not yet dropped
    channels_open: AtomicU64,

    // === HISTOGRAMS ===
    insert_duration_sum_ms: AtomicU64,
    insert_duration_count: AtomicU64,
    /// Cumulative buckets, last one is +Inf
    insert_duration_buckets: [AtomicU64; INSERT_DURATION_BUCKETS_MS.len() + 1],
}

impl ClientMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            inserts_total: AtomicU64::new(0),
            rows_inserted_total: AtomicU64::new(0),
            bytes_uploaded_total: AtomicU64::new(0),
            upload_retries_total: AtomicU64::new(0),
            commit_polls_total: AtomicU64::new(0),
            commits_confirmed_total: AtomicU64::new(0),
            refreshes_succeeded_total: AtomicU64::new(0),
            refreshes_failed_total: AtomicU64::new(0),
            errors: Default::default(),
            channels_open: AtomicU64::new(0),
            insert_duration_sum_ms: AtomicU64::new(0),
            insert_duration_count: AtomicU64::new(0),
            insert_duration_buckets: Default::default(),
        }
    }

    // === COUNTER RECORDING ===

    /// Record a successful insert.
    pub fn record_insert(&self, rows: usize, uploaded_bytes: usize, duration: Duration) {
        self.inserts_total.fetch_add(1, Ordering::Relaxed);
        self.rows_inserted_total
            .fetch_add(rows as u64, Ordering::Relaxed);
        self.bytes_uploaded_total
            .fetch_add(uploaded_bytes as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.insert_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.insert_duration_count.fetch_add(1, Ordering::Relaxed);
        for (i, &bucket_ms) in INSERT_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.insert_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.insert_duration_buckets[INSERT_DURATION_BUCKETS_MS.len()]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload_retry(&self) {
        self.upload_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_polls(&self, polls: u32, confirmed: bool) {
        self.commit_polls_total
            .fetch_add(u64::from(polls), Ordering::Relaxed);
        if confirmed {
            self.commits_confirmed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_refresh(&self, succeeded: bool) {
        if succeeded {
            self.refreshes_succeeded_total
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.refreshes_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a failed operation by error kind.
    pub fn record_error(&self, kind: ErrorKind) {
        if let Some(i) = ErrorKind::ALL.iter().position(|k| *k == kind) {
            self.errors[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    // === GAUGE UPDATES ===

    pub fn channel_opened(&self) {
        self.channels_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_dropped(&self) {
        let _ = self
            .channels_open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // === GETTERS ===

    pub fn inserts_total(&self) -> u64 {
        self.inserts_total.load(Ordering::Relaxed)
    }

    pub fn rows_inserted_total(&self) -> u64 {
        self.rows_inserted_total.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded_total(&self) -> u64 {
        self.bytes_uploaded_total.load(Ordering::Relaxed)
    }

    pub fn upload_retries_total(&self) -> u64 {
        self.upload_retries_total.load(Ordering::Relaxed)
    }

    pub fn commit_polls_total(&self) -> u64 {
        self.commit_polls_total.load(Ordering::Relaxed)
    }

    pub fn commits_confirmed_total(&self) -> u64 {
        self.commits_confirmed_total.load(Ordering::Relaxed)
    }

    pub fn refreshes_succeeded_total(&self) -> u64 {
        self.refreshes_succeeded_total.load(Ordering::Relaxed)
    }

    pub fn refreshes_failed_total(&self) -> u64 {
        self.refreshes_failed_total.load(Ordering::Relaxed)
    }

    pub fn errors_by_kind(&self, kind: ErrorKind) -> u64 {
        ErrorKind::ALL
            .iter()
            .position(|k| *k == kind)
            .map(|i| self.errors[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors.iter().map(|e| e.load(Ordering::Relaxed)).sum()
    }

    pub fn channels_open(&self) -> u64 {
        self.channels_open.load(Ordering::Relaxed)
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// ```
    /// use sluice_core::metrics::ClientMetrics;
    ///
    /// let metrics = ClientMetrics::new();
    /// metrics.record_refresh(true);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("sluice_refreshes_total{result=\"success\"} 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let mut output = String::with_capacity(4096);

        counter(
            &mut output,
            "sluice_inserts_total",
            "Successful insert calls",
            self.inserts_total(),
        );
        counter(
            &mut output,
            "sluice_rows_inserted_total",
            "Rows accepted by successful inserts",
            self.rows_inserted_total(),
        );
        counter(
            &mut output,
            "sluice_bytes_uploaded_total",
            "Encrypted bytes uploaded to the stage",
            self.bytes_uploaded_total(),
        );
        counter(
            &mut output,
            "sluice_upload_retries_total",
            "Stage upload attempts beyond the first",
            self.upload_retries_total(),
        );
        counter(
            &mut output,
            "sluice_commit_polls_total",
            "Channel status polls while waiting for commits",
            self.commit_polls_total(),
        );
        counter(
            &mut output,
            "sluice_commits_confirmed_total",
            "Commit waits that observed persisted data",
            self.commits_confirmed_total(),
        );

        output.push_str("# HELP sluice_refreshes_total Stage credential refreshes by result\n");
        output.push_str("# TYPE sluice_refreshes_total counter\n");
        output.push_str(&format!(
            "sluice_refreshes_total{{result=\"success\"}} {}\n",
            self.refreshes_succeeded_total()
        ));
        output.push_str(&format!(
            "sluice_refreshes_total{{result=\"failure\"}} {}\n",
            self.refreshes_failed_total()
        ));
        output.push('\n');

        output.push_str("# HELP sluice_errors_total Failed operations by error kind\n");
        output.push_str("# TYPE sluice_errors_total counter\n");
        for kind in ErrorKind::ALL {
            output.push_str(&format!(
                "sluice_errors_total{{kind=\"{}\"}} {}\n",
                kind.as_label(),
                self.errors_by_kind(kind)
            ));
        }
        output.push('\n');

        output.push_str("# HELP sluice_channels_open Channels currently open\n");
        output.push_str("# TYPE sluice_channels_open gauge\n");
        output.push_str(&format!("sluice_channels_open {}\n", self.channels_open()));
        output.push('\n');

        output.push_str(
            "# HELP sluice_insert_duration_seconds Insert duration from build to registration\n",
        );
        output.push_str("# TYPE sluice_insert_duration_seconds histogram\n");
        for (i, bucket_ms) in INSERT_DURATION_BUCKETS_MS.iter().enumerate() {
            output.push_str(&format!(
                "sluice_insert_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                *bucket_ms as f64 / 1000.0,
                self.insert_duration_buckets[i].load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "sluice_insert_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.insert_duration_buckets[INSERT_DURATION_BUCKETS_MS.len()].load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "sluice_insert_duration_seconds_sum {}\n",
            self.insert_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        output.push_str(&format!(
            "sluice_insert_duration_seconds_count {}\n",
            self.insert_duration_count.load(Ordering::Relaxed)
        ));

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    output.push_str(&format!("{} {}\n", name, value));
    output.push('\n');
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ClientMetrics::new();

        metrics.record_insert(3, 1024, Duration::from_millis(20));
        metrics.record_insert(2, 512, Duration::from_millis(300));
        assert_eq!(metrics.inserts_total(), 2);
        assert_eq!(metrics.rows_inserted_total(), 5);
        assert_eq!(metrics.bytes_uploaded_total(), 1536);

        metrics.record_upload_retry();
        metrics.record_commit_polls(4, true);
        metrics.record_commit_polls(2, false);
        assert_eq!(metrics.upload_retries_total(), 1);
        assert_eq!(metrics.commit_polls_total(), 6);
        assert_eq!(metrics.commits_confirmed_total(), 1);

        metrics.record_error(ErrorKind::StaleCredential);
        metrics.record_error(ErrorKind::StaleCredential);
        metrics.record_error(ErrorKind::ProtocolInvariant);
        assert_eq!(metrics.errors_by_kind(ErrorKind::StaleCredential), 2);
        assert_eq!(metrics.errors_by_kind(ErrorKind::Upload), 0);
        assert_eq!(metrics.errors_total(), 3);
    }

    #[test]
    fn test_channel_gauge_never_underflows() {
        let metrics = ClientMetrics::new();
        metrics.channel_opened();
        metrics.channel_dropped();
        metrics.channel_dropped();
        assert_eq!(metrics.channels_open(), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = ClientMetrics::new();
        metrics.record_insert(3, 100, Duration::from_millis(75));
        metrics.record_refresh(false);
        metrics.record_error(ErrorKind::Commit);

        let text = metrics.export_prometheus_text();
        assert!(text.contains("# TYPE sluice_inserts_total counter"));
        assert!(text.contains("sluice_inserts_total 1"));
        assert!(text.contains("sluice_rows_inserted_total 3"));
        assert!(text.contains("sluice_refreshes_total{result=\"failure\"} 1"));
        assert!(text.contains("sluice_errors_total{kind=\"commit\"} 1"));
        assert!(text.contains("sluice_insert_duration_seconds_bucket{le=\"0.05\"} 0"));
        assert!(text.contains("sluice_insert_duration_seconds_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("sluice_insert_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("sluice_insert_duration_seconds_count 1"));
    }
}
