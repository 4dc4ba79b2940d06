//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the wallet.
//!
//! # Metrics
//!
//! - `wallet_movements_total{kind}` - Committed top-ups, deductions and refunds
//! - `wallet_rejections_total{kind}` - Rejected operations by error kind
//! - `wallet_redemption_conflicts_total` - Replayed redemption intents
//! - `wallet_consistency_faults_total` - Cached balances healed from the ledger
//! - `wallet_operation_duration_seconds` - Histogram of money movement latencies

use crate::error::ErrorKind;
use crate::types::EntryKind;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed movements by entry kind
    pub movements_total: IntCounterVec,

    /// Rejected operations by error kind
    pub rejections_total: IntCounterVec,

    /// Replayed redemption intents
    pub redemption_conflicts: IntCounter,

    /// Healed consistency faults
    pub consistency_faults: IntCounter,

    /// Operation duration histogram
    pub operation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let movements_total = IntCounterVec::new(
            Opts::new("wallet_movements_total", "Committed money movements"),
            &["kind"],
        )?;
        registry.register(Box::new(movements_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("wallet_rejections_total", "Rejected wallet operations"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let redemption_conflicts = IntCounter::new(
            "wallet_redemption_conflicts_total",
            "Redemption intents presented after being consumed",
        )?;
        registry.register(Box::new(redemption_conflicts.clone()))?;

        let consistency_faults = IntCounter::new(
            "wallet_consistency_faults_total",
            "Cached balances that diverged from the ledger and were corrected",
        )?;
        registry.register(Box::new(consistency_faults.clone()))?;

        let operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "wallet_operation_duration_seconds",
                "Histogram of money movement latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            movements_total,
            rejections_total,
            redemption_conflicts,
            consistency_faults,
            operation_duration,
            registry,
        })
    }

    /// Record a committed movement
    pub fn record_movement(&self, kind: EntryKind) {
        self.movements_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record a rejected operation
    pub fn record_rejection(&self, kind: ErrorKind) {
        let label = match kind {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Internal => "internal",
        };
        self.rejections_total.with_label_values(&[label]).inc();
    }

    /// Record a replayed redemption intent
    pub fn record_redemption_conflict(&self) {
        self.redemption_conflicts.inc();
    }

    /// Record a healed consistency fault
    pub fn record_consistency_fault(&self) {
        self.consistency_faults.inc();
    }

    /// Record operation duration
    pub fn record_operation_duration(&self, duration_seconds: f64) {
        self.operation_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
