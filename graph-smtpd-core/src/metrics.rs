//! Relay counters, exported through whichever OpenTelemetry meter provider
//! is installed globally.
//!
//! Each instrument keeps a local mirror so the totals can be logged at
//! shutdown and read back in tests without a collector.

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

/// Relay-wide counters, shared by every session
#[derive(Debug)]
pub struct Metrics {
    /// Connections handed to the backend, allowed or not
    connections_total: Counter<u64>,

    /// Messages accepted by the directory API
    messages_sent: Counter<u64>,

    /// Refused sources and senders
    denied_total: Counter<u64>,

    /// Failed transactions by error kind
    errors_total: Counter<u64>,

    connections: AtomicU64,
    sent: AtomicU64,
    denied: AtomicU64,
    errored: AtomicU64,
}

/// A point-in-time copy of the local totals in [`Metrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub connections: u64,
    pub sent: u64,
    pub denied: u64,
    pub errored: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Build the relay instruments from the global meter provider. Without
    /// an installed provider the instruments are no-ops and only the local
    /// totals move.
    pub fn new() -> Self {
        let meter = meter();

        let connections_total = meter
            .u64_counter("graph_smtpd.relay.connections.total")
            .with_description("Total number of SMTP connections received")
            .build();

        let messages_sent = meter
            .u64_counter("graph_smtpd.relay.messages.sent.total")
            .with_description("Total number of messages sent through Graph")
            .build();

        let denied_total = meter
            .u64_counter("graph_smtpd.relay.denied.total")
            .with_description("Total number of refused sources and senders")
            .build();

        let errors_total = meter
            .u64_counter("graph_smtpd.relay.errors.total")
            .with_description("Total number of failed transactions by kind")
            .build();

        Self {
            connections_total,
            messages_sent,
            denied_total,
            errors_total,
            connections: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errored: AtomicU64::new(0),
        }
    }

    pub fn record_connection(&self) {
        self.connections_total.add(1, &[]);
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.add(1, &[]);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refusal; `stage` is `"source"` or `"sender"`
    pub fn record_denied(&self, stage: &'static str) {
        self.denied_total.add(1, &[KeyValue::new("stage", stage)]);
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors_total.add(1, &[KeyValue::new("kind", kind)]);
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self.connections.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("graph_smtpd.relay")
}
