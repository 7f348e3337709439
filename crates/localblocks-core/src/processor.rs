//! Per-tenant processor: span intake, idle cuts and the background loops.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::blocks::BlockManager;
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_tenant, LocalBlocksConfig};
use crate::filter::filter_batch;
use crate::live_traces::LiveTraces;
use crate::metrics::{ProcessorMetrics, REASON_LIVE_TRACES_EXCEEDED};
use crate::model::encode_trace;
use crate::scheduler::Scheduler;
use crate::storage::{Encoding, Wal};
use crate::Result;

pub const PROCESSOR_NAME: &str = "LocalBlocksProcessor";

const DELETE_PERIOD: Duration = Duration::from_secs(10);
const COMPLETE_PERIOD: Duration = Duration::from_secs(10);
const METRIC_PERIOD: Duration = Duration::from_secs(10);

/// A consumer of resource-span batches plugged into the generator pipeline
#[async_trait]
pub trait SpanProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push_spans(&self, batches: Vec<ResourceSpans>);

    async fn shutdown(&self);
}

/// State shared between the ingestion path and the background loops
struct Engine {
    tenant: String,
    cfg: LocalBlocksConfig,
    live_traces: Mutex<LiveTraces>,
    blocks: BlockManager,
    metrics: Arc<dyn ProcessorMetrics>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    fn push(&self, batches: Vec<ResourceSpans>) {
        let created = {
            let mut live = self.live_traces.lock();
            let before = live.len();
            let now = self.clock.now();

            for batch in batches {
                let Some(batch) = filter_batch(batch) else {
                    continue;
                };
                if let Err(e) = live.push(batch, self.cfg.max_live_traces, now) {
                    debug!(tenant = %self.tenant, "Dropping batch: {}", e);
                    self.metrics
                        .inc_dropped_traces(&self.tenant, REASON_LIVE_TRACES_EXCEEDED);
                }
            }

            live.len().saturating_sub(before)
        };

        self.metrics.inc_total_traces(&self.tenant, created as u64);
    }

    fn idle_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.cfg.trace_idle_period)
            .ok()
            .and_then(|idle| self.clock.now().checked_sub_signed(idle))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn cut_idle_traces(&self, immediate: bool) -> Result<()> {
        let cut = {
            let mut live = self.live_traces.lock();
            self.metrics.set_live_traces(&self.tenant, live.len() as u64);

            let since = if immediate { None } else { Some(self.idle_cutoff()) };
            live.cut_idle(since)
        };

        if cut.is_empty() {
            return Ok(());
        }

        let count = cut.len();
        for trace in cut {
            let record = encode_trace(trace.batches);
            self.blocks.write_head_block(&trace.id, &record)?;
        }
        debug!(tenant = %self.tenant, traces = count, "Idle traces written to head block");

        self.blocks.flush_head_block()
    }

    fn record_block_bytes(&self) {
        self.metrics.set_block_bytes(&self.tenant, self.blocks.total_bytes());
    }

    fn flush_tick(&self) {
        if let Err(e) = self.cut_idle_traces(false) {
            error!(tenant = %self.tenant, "Failed to cut idle traces: {}", e);
        }
        if let Err(e) = self.blocks.cut_blocks(false) {
            error!(tenant = %self.tenant, "Failed to cut head block: {}", e);
        }
    }

    fn delete_tick(&self) {
        if let Err(e) = self.blocks.delete_old_blocks() {
            error!(tenant = %self.tenant, "Failed to delete old blocks: {}", e);
        }
    }

    fn complete_tick(&self) {
        if let Err(e) = self.blocks.complete_block() {
            error!(tenant = %self.tenant, "Failed to complete block: {}", e);
        }
    }
}

/// Buffers one tenant's server spans by trace and moves them through the
/// head, write-ahead and complete block stages.
pub struct Processor {
    engine: Arc<Engine>,
    scheduler: Scheduler,
    closed: AtomicBool,
}

impl Processor {
    pub async fn new(
        cfg: LocalBlocksConfig,
        tenant: &str,
        wal: Arc<dyn Wal>,
        encoding: Arc<dyn Encoding>,
        metrics: Arc<dyn ProcessorMetrics>,
    ) -> Result<Self> {
        Self::with_clock(cfg, tenant, wal, encoding, metrics, Arc::new(SystemClock)).await
    }

    /// Validates the config, reloads blocks from storage and starts the
    /// background loops. Must be called from within a tokio runtime.
    pub async fn with_clock(
        cfg: LocalBlocksConfig,
        tenant: &str,
        wal: Arc<dyn Wal>,
        encoding: Arc<dyn Encoding>,
        metrics: Arc<dyn ProcessorMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;
        validate_tenant(tenant)?;

        let engine = Arc::new(Engine {
            tenant: tenant.to_string(),
            blocks: BlockManager::new(tenant, cfg.clone(), wal, encoding, clock.clone()),
            cfg,
            live_traces: Mutex::new(LiveTraces::new()),
            metrics,
            clock,
        });

        let e = engine.clone();
        tokio::task::spawn_blocking(move || e.blocks.reload_blocks()).await??;

        let scheduler = Scheduler::new();

        let e = engine.clone();
        scheduler.spawn_periodic("flush", engine.cfg.flush_check_period, move || e.flush_tick());
        let e = engine.clone();
        scheduler.spawn_periodic("delete", DELETE_PERIOD, move || e.delete_tick());
        let e = engine.clone();
        scheduler.spawn_periodic("complete", COMPLETE_PERIOD, move || e.complete_tick());
        let e = engine.clone();
        scheduler.spawn_periodic("metrics", METRIC_PERIOD, move || e.record_block_bytes());

        info!(tenant = %engine.tenant, "Local blocks processor started");

        Ok(Self {
            engine,
            scheduler,
            closed: AtomicBool::new(false),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.engine.tenant
    }

    /// Filters the batches down to server spans and buffers them by trace.
    /// Batches opening a new trace past the live trace limit are dropped and
    /// counted.
    pub fn push(&self, batches: Vec<ResourceSpans>) {
        self.engine.push(batches);
    }

    /// Writes idle traces, or every trace when `immediate`, to the head block
    pub fn cut_idle_traces(&self, immediate: bool) -> Result<()> {
        self.engine.cut_idle_traces(immediate)
    }

    pub fn record_block_bytes(&self) {
        self.engine.record_block_bytes();
    }

    pub fn live_trace_count(&self) -> usize {
        self.engine.live_traces.lock().len()
    }

    pub fn blocks(&self) -> &BlockManager {
        &self.engine.blocks
    }

    /// Stops the background loops, then writes out every live trace and cuts
    /// the head block. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.scheduler.stop().await;

        let engine = self.engine.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            if let Err(e) = engine.cut_idle_traces(true) {
                error!(tenant = %engine.tenant, "Failed to cut idle traces on shutdown: {}", e);
            }
            if let Err(e) = engine.blocks.cut_blocks(true) {
                error!(tenant = %engine.tenant, "Failed to cut head block on shutdown: {}", e);
            }
        })
        .await;
        if let Err(e) = flushed {
            error!(tenant = %self.engine.tenant, "Shutdown flush failed: {}", e);
        }

        info!(tenant = %self.engine.tenant, "Local blocks processor stopped");
    }
}

#[async_trait]
impl SpanProcessor for Processor {
    fn name(&self) -> &'static str {
        PROCESSOR_NAME
    }

    async fn push_spans(&self, batches: Vec<ResourceSpans>) {
        self.push(batches);
    }

    async fn shutdown(&self) {
        Processor::shutdown(self).await;
    }
}
