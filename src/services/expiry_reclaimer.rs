//! src/services/expiry_reclaimer.rs
//!
//! Background sweeper. Each pass permanently removes temp-deleted archives
//! past their expiry and cleans up staged uploads that never committed.
//! The two sweeps are independent: one failing does not skip the other.

use crate::clock::Clock;
use crate::services::{
    archive_error::{ArchiveResult, StoreContext},
    lifecycle_engine::LifecycleEngine,
    metadata_index::MetadataIndex,
};
use chrono::SubsecRound;
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Age after which a staged upload counts as abandoned.
    pub staging_ttl: chrono::Duration,
    /// Upper bound on a single pass.
    pub pass_timeout: Duration,
    /// Records fetched per sweep query.
    pub batch_size: i64,
    /// Records reclaimed concurrently within a sweep.
    pub concurrency: usize,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            staging_ttl: chrono::Duration::hours(24),
            pass_timeout: Duration::from_secs(300),
            batch_size: 100,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub expired: SweepReport,
    pub abandoned: SweepReport,
}

pub struct ExpiryReclaimer {
    engine: Arc<LifecycleEngine>,
    index: Arc<dyn MetadataIndex>,
    clock: Arc<dyn Clock>,
    config: ReclaimerConfig,
}

/// Handle to a running reclaimer task.
pub struct ReclaimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Signal the loop and wait for the in-flight pass to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("reclaimer task ended abnormally: {}", err);
        }
    }
}

impl ExpiryReclaimer {
    pub fn new(
        engine: Arc<LifecycleEngine>,
        index: Arc<dyn MetadataIndex>,
        clock: Arc<dyn Clock>,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            engine,
            index,
            clock,
            config,
        }
    }

    /// Permanently remove temp-deleted archives whose expiry has passed.
    pub async fn sweep_expired(&self) -> ArchiveResult<SweepReport> {
        let now = self.clock.now().trunc_subsecs(3);
        let expired = self
            .index
            .find_expired(now, self.config.batch_size)
            .await
            .context("find expired archives", now.to_rfc3339())?;

        let engine = self.engine.clone();
        let outcomes: Vec<_> = stream::iter(expired)
            .map(move |record| {
                let engine = engine.clone();
                async move {
                    let outcome = engine.reclaim_if_expired(&record).await;
                    (record, outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(archive_id = %record.id, "failed to reclaim expired archive: {}", err);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Delete blobs of uploads that were staged but never committed.
    pub async fn sweep_abandoned_staged(&self) -> ArchiveResult<SweepReport> {
        let cutoff = self.clock.now().trunc_subsecs(3) - self.config.staging_ttl;
        let abandoned = self
            .index
            .find_abandoned_staged(cutoff, self.config.batch_size)
            .await
            .context("find abandoned uploads", cutoff.to_rfc3339())?;

        let engine = self.engine.clone();
        let outcomes: Vec<_> = stream::iter(abandoned)
            .map(move |staged| {
                let engine = engine.clone();
                async move {
                    let outcome = engine.reclaim_staged(&staged).await;
                    (staged, outcome)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (staged, outcome) in outcomes {
            match outcome {
                Ok(blobs) => report.reclaimed += blobs,
                Err(err) => {
                    warn!(staged_id = %staged.id, "failed to reclaim staged upload: {}", err);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// One full pass: both sweeps, each logged on its own.
    pub async fn run_once(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        match self.sweep_expired().await {
            Ok(expired) => report.expired = expired,
            Err(err) => error!("expired archive sweep failed: {}", err),
        }
        match self.sweep_abandoned_staged().await {
            Ok(abandoned) => report.abandoned = abandoned,
            Err(err) => error!("abandoned upload sweep failed: {}", err),
        }

        if report != ReclaimReport::default() {
            info!(
                expired = report.expired.reclaimed,
                abandoned = report.abandoned.reclaimed,
                failed = report.expired.failed + report.abandoned.failed,
                "reclaim pass complete"
            );
        }
        report
    }

    /// Spawn the periodic loop. The first pass runs one interval after start.
    pub fn start(self: Arc<Self>) -> ReclaimerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let period = self.config.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            info!(interval = ?period, "reclaimer started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let pass = tokio::time::timeout(self.config.pass_timeout, self.run_once());
                        tokio::select! {
                            _ = token.cancelled() => break,
                            outcome = pass => {
                                if outcome.is_err() {
                                    warn!(timeout = ?self.config.pass_timeout, "reclaim pass timed out");
                                }
                            }
                        }
                    }
                }
            }
            info!("reclaimer stopped");
        });

        ReclaimerHandle { cancel, task }
    }
}
