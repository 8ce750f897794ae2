//! Audit Trail (buffered, tamper-evident)
//!
//! Callers enqueue entries on a bounded channel. A single flusher task owns
//! the buffer and writes batches when it fills, on a timer, on request and at
//! shutdown. A batch that fails to persist stays buffered, and while it is
//! retained only the timer, explicit flushes and shutdown retry it.

mod entry;
mod store;

pub use entry::{AuditLogEntry, AuditStatus, GENESIS_HASH};
pub use store::{AuditFilter, AuditStore, ChainVerification, ExportFormat};

use crate::config::AuditConfig;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tenancy_common::{Database, TenancyError, TenancyResult, TenantId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

enum Command {
    Record(AuditLogEntry),
    Flush(oneshot::Sender<TenancyResult<usize>>),
    Shutdown(oneshot::Sender<()>),
}

/// Buffered audit log
pub struct AuditLogManager {
    sender: mpsc::Sender<Command>,
    store: AuditStore,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl AuditLogManager {
    /// Spawn the flusher on the current tokio runtime
    pub fn start(db: Database, config: &AuditConfig) -> Self {
        let capacity = config.buffer_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let store = AuditStore::new(db);

        let flusher = Flusher {
            receiver,
            store: store.clone(),
            buffer: Vec::with_capacity(capacity),
            capacity,
            max_retained: config.max_retained_entries.max(capacity),
            interval: config.flush_interval(),
            retrying: false,
        };
        let worker = tokio::spawn(flusher.run());
        info!(
            capacity,
            flush_interval_secs = config.flush_interval_secs,
            "Audit log started"
        );

        Self {
            sender,
            store,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Enqueue `entry`. Fails with [`TenancyError::AuditClosed`] once
    /// shutdown has begun.
    pub async fn log_action(&self, entry: AuditLogEntry) -> TenancyResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TenancyError::AuditClosed);
        }
        debug!(tenant_id = entry.tenant_id, action = %entry.action, "Audit entry queued");
        self.sender
            .send(Command::Record(entry))
            .await
            .map_err(|_| TenancyError::AuditClosed)?;
        metrics::counter!("audit_entries_logged_total").increment(1);
        Ok(())
    }

    /// Enqueue `entry`, logging instead of failing. For callers whose own
    /// outcome must not depend on the audit log.
    pub async fn record(&self, entry: AuditLogEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.log_action(entry).await {
            warn!(error = %e, %action, "Audit entry dropped");
        }
    }

    /// Persist everything buffered so far; returns the number written
    pub async fn flush(&self) -> TenancyResult<usize> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Flush(reply))
            .await
            .map_err(|_| TenancyError::AuditClosed)?;
        response.await.map_err(|_| TenancyError::AuditClosed)?
    }

    /// Stop accepting entries, drain and flush within the shutdown timeout
    pub async fn shutdown(&self) -> TenancyResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (ack, acked) = oneshot::channel();
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            self.sender.send(Command::Shutdown(ack)).await.ok()?;
            acked.await.ok()
        })
        .await;

        let worker = self.worker.lock().take();
        match drained {
            Ok(Some(())) => {
                if let Some(worker) = worker {
                    let _ = worker.await;
                }
                info!("Audit log shut down");
                Ok(())
            }
            Ok(None) => {
                warn!("Audit flusher already stopped");
                Ok(())
            }
            Err(_) => {
                if let Some(worker) = worker {
                    worker.abort();
                }
                error!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Final audit flush timed out"
                );
                Err(TenancyError::Persistence("final audit flush timed out".into()))
            }
        }
    }

    /// Shutdown has begun
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Paged persisted entries, newest first
    pub fn get_audit_logs(&self, tenant_id: TenantId, limit: i64, offset: i64) -> TenancyResult<Vec<AuditLogEntry>> {
        self.store.query(&AuditFilter::tenant(tenant_id).page(limit, offset))
    }

    /// Persisted entries with `action`, newest first
    pub fn get_audit_logs_by_action(
        &self,
        tenant_id: TenantId,
        action: &str,
        limit: i64,
    ) -> TenancyResult<Vec<AuditLogEntry>> {
        self.store
            .query(&AuditFilter::tenant(tenant_id).action(action).page(limit, 0))
    }

    /// Failed entries from the last `since_minutes` minutes, newest first
    pub fn get_failed_attempts(&self, tenant_id: TenantId, since_minutes: i64) -> TenancyResult<Vec<AuditLogEntry>> {
        let since = Utc::now() - ChronoDuration::minutes(since_minutes);
        self.store.query(
            &AuditFilter::tenant(tenant_id)
                .status(AuditStatus::Failure)
                .since(since),
        )
    }

    /// Persisted entries matching `filter`, newest first
    pub fn query(&self, filter: &AuditFilter) -> TenancyResult<Vec<AuditLogEntry>> {
        self.store.query(filter)
    }

    /// Persisted entries matching `filter`, ignoring paging
    pub fn count(&self, filter: &AuditFilter) -> TenancyResult<u64> {
        self.store.count(filter)
    }

    /// Walk the tenant's persisted hash chain
    pub fn verify_chain(&self, tenant_id: TenantId) -> TenancyResult<ChainVerification> {
        self.store.verify_chain(tenant_id)
    }

    /// Render the tenant's persisted entries, oldest first
    pub fn export(&self, tenant_id: TenantId, format: ExportFormat) -> TenancyResult<String> {
        self.store.export(tenant_id, format)
    }
}

impl Drop for AuditLogManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!("Audit log dropped without shutdown; flusher will drain on channel close");
        }
    }
}

struct Flusher {
    receiver: mpsc::Receiver<Command>,
    store: AuditStore,
    buffer: Vec<AuditLogEntry>,
    capacity: usize,
    max_retained: usize,
    interval: Duration,
    /// A failed batch is buffered and waits for the ticker
    retrying: bool,
}

impl Flusher {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(Command::Record(entry)) => self.record(entry).await,
                    Some(Command::Flush(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.drain();
                        let _ = self.flush().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
            }
        }
        debug!("Audit flusher stopped");
    }

    async fn record(&mut self, entry: AuditLogEntry) {
        self.buffer.push(entry);
        if !self.retrying && self.buffer.len() >= self.capacity {
            let _ = self.flush().await;
        }
    }

    /// Pull entries that raced in ahead of shutdown
    fn drain(&mut self) {
        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Record(entry) => self.buffer.push(entry),
                Command::Flush(reply) => {
                    let _ = reply.send(Err(TenancyError::AuditClosed));
                }
                Command::Shutdown(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn flush(&mut self) -> TenancyResult<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.buffer);
        let pending = batch.len();
        let store = self.store.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let result = store.append(&batch);
            (batch, result)
        })
        .await;

        match joined {
            Ok((_, Ok(written))) => {
                self.retrying = false;
                metrics::counter!("audit_entries_flushed_total").increment(written as u64);
                debug!(written, "Audit batch flushed");
                Ok(written)
            }
            Ok((batch, Err(e))) => {
                metrics::counter!("audit_flush_failures_total").increment(1);
                error!(error = %e, pending, "Audit flush failed, batch kept for retry");
                self.retain(batch);
                self.retrying = true;
                Err(e)
            }
            Err(join) => {
                metrics::counter!("audit_flush_failures_total").increment(1);
                error!(error = %join, pending, "Audit flush task failed, batch lost");
                Err(TenancyError::Persistence(join.to_string()))
            }
        }
    }

    /// Put a failed batch back ahead of anything buffered since
    fn retain(&mut self, mut batch: Vec<AuditLogEntry>) {
        batch.append(&mut self.buffer);
        if batch.len() > self.max_retained {
            let dropped = batch.len() - self.max_retained;
            error!(dropped, "Audit retry buffer full, dropping oldest entries");
            batch.drain(..dropped);
        }
        self.buffer = batch;
    }
}
