//! The Sync Engine keeps the index a faithful projection of the catalog.
//!
//! Catalog writers call [`SyncHandle::notify_catalog_change`] after every
//! write. One dispatcher task applies events in arrival order, which keeps
//! per-product ordering and serializes category renames against product
//! events. When the queue backs up past the high-water mark, consecutive
//! events for the same product collapse to the latest one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogReader;
use crate::config::SyncConfig;
use crate::error::{IndexError, SyncError};
use crate::index::Document;
use crate::models::Product;
use crate::persist::SCHEMA_VERSION;
use crate::store::Index;

/// A catalog mutation, as emitted by the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogChange {
    Inserted { snapshot: Product },
    Updated { snapshot: Product },
    Deleted { product_id: String },
    CategoryRenamed { category_id: String, new_name: String },
}

impl CatalogChange {
    /// The product this event touches; `None` for category events.
    pub fn product_id(&self) -> Option<&str> {
        match self {
            CatalogChange::Inserted { snapshot } | CatalogChange::Updated { snapshot } => Some(&snapshot.id),
            CatalogChange::Deleted { product_id } => Some(product_id),
            CatalogChange::CategoryRenamed { .. } => None,
        }
    }

    fn subject(&self) -> String {
        match self {
            CatalogChange::CategoryRenamed { category_id, .. } => format!("category:{category_id}"),
            other => format!("product:{}", other.product_id().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Indexed,
    Removed,
    CategoryUpdated { documents: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub rebuilt: bool,
    pub scanned: usize,
    pub indexed: usize,
}

pub struct SyncEngine {
    index: Arc<dyn Index>,
    catalog: Arc<dyn CatalogReader>,
    config: SyncConfig,
    /// Held by event application and by full rebuilds, so a rebuild's
    /// catalog scan and swap never straddle an event.
    writes: Mutex<()>,
}

impl SyncEngine {
    pub fn new(index: Arc<dyn Index>, catalog: Arc<dyn CatalogReader>, config: SyncConfig) -> Self {
        Self { index, catalog, config, writes: Mutex::new(()) }
    }

    /// Apply one event to the index, retrying transient index faults.
    pub async fn apply(&self, change: &CatalogChange) -> Result<SyncOutcome, SyncError> {
        let _writes = self.writes.lock().await;
        let subject = change.subject();
        match change {
            CatalogChange::Inserted { snapshot } | CatalogChange::Updated { snapshot } => {
                if !snapshot.is_active() {
                    self.with_retry(&subject, |ix| ix.remove(&snapshot.id)).await?;
                    return Ok(SyncOutcome::Removed);
                }
                let category_name = self.category_name(snapshot.category_id.as_deref()).await?;
                let doc = Document::from_product(snapshot, category_name.as_deref());
                self.with_retry(&subject, |ix| ix.upsert(doc.clone())).await?;
                Ok(SyncOutcome::Indexed)
            }
            CatalogChange::Deleted { product_id } => {
                self.with_retry(&subject, |ix| ix.remove(product_id)).await?;
                Ok(SyncOutcome::Removed)
            }
            CatalogChange::CategoryRenamed { category_id, new_name } => {
                let members = self
                    .catalog
                    .products_in_category(category_id)
                    .await
                    .map_err(|e| SyncError::Catalog(e.to_string()))?;
                let mut updated = 0;
                for product in members {
                    let Some(mut doc) = self.index.document(&product.id) else {
                        continue;
                    };
                    if doc.category_name == *new_name {
                        continue;
                    }
                    doc.category_name = new_name.clone();
                    self.with_retry(&subject, |ix| ix.upsert(doc.clone())).await?;
                    updated += 1;
                }
                info!(category_id, documents = updated, "category rename applied");
                Ok(SyncOutcome::CategoryUpdated { documents: updated })
            }
        }
    }

    async fn category_name(&self, category_id: Option<&str>) -> Result<Option<String>, SyncError> {
        let Some(id) = category_id else {
            return Ok(None);
        };
        let category = self.catalog.category(id).await.map_err(|e| SyncError::Catalog(e.to_string()))?;
        Ok(category.map(|c| c.name))
    }

    async fn with_retry<T, F>(&self, subject: &str, op: F) -> Result<T, SyncError>
    where
        F: Fn(&dyn Index) -> Result<T, IndexError>,
    {
        let mut attempt = 1;
        loop {
            match op(self.index.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(subject, attempt, ?delay, error = %e, "index write failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(subject, attempts = attempt, error = %e, "sync fault");
                    return Err(SyncError::Fault {
                        subject: subject.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Startup check: rebuild from the catalog when the index is empty or
    /// was written under another schema version.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        let stats = self.with_retry("reconcile", |ix| ix.stats()).await?;
        let reason = if stats.documents == 0 {
            Some("index empty")
        } else if stats.schema_version != Some(SCHEMA_VERSION) {
            Some("schema version changed")
        } else {
            None
        };
        let Some(reason) = reason else {
            info!(documents = stats.documents, "index populated; reconciliation not needed");
            return Ok(ReconcileReport { rebuilt: false, scanned: 0, indexed: stats.documents });
        };
        info!(reason, "rebuilding index from catalog");
        let report = self.rebuild_from_catalog().await?;
        info!(scanned = report.scanned, indexed = report.indexed, "reconciliation complete");
        Ok(report)
    }

    /// Scan every active product in bounded batches and swap the result in.
    /// Events arriving meanwhile wait and are applied on top of the result.
    pub async fn rebuild_from_catalog(&self) -> Result<ReconcileReport, SyncError> {
        let _writes = self.writes.lock().await;
        let batch_size = self.config.rebuild_batch_size.max(1);
        let mut names: HashMap<String, Option<String>> = HashMap::new();
        let mut docs = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self
                .catalog
                .active_products(offset, batch_size)
                .await
                .map_err(|e| SyncError::Catalog(e.to_string()))?;
            let fetched = batch.len();
            for product in batch {
                let name = match product.category_id.as_deref() {
                    Some(id) => match names.get(id) {
                        Some(cached) => cached.clone(),
                        None => {
                            let name = self.category_name(Some(id)).await?;
                            names.insert(id.to_string(), name.clone());
                            name
                        }
                    },
                    None => None,
                };
                docs.push(Document::from_product(&product, name.as_deref()));
            }
            offset += fetched;
            debug!(scanned = offset, "catalog batch read");
            if fetched < batch_size {
                break;
            }
        }
        let scanned = docs.len();
        let indexed = self.with_retry("rebuild", |ix| ix.replace_all(docs.clone())).await?;
        Ok(ReconcileReport { rebuilt: true, scanned, indexed })
    }

    /// Start the dispatcher task.
    pub fn spawn(self: Arc<Self>) -> (SyncHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (SyncHandle { tx }, task)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < self.config.queue_capacity {
                match rx.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
            if batch.len() > self.config.high_water_mark {
                let before = batch.len();
                batch = coalesce(batch);
                debug!(before, after = batch.len(), "coalesced sync backlog");
            }
            for envelope in batch {
                let result = self.apply(&envelope.change).await;
                for ack in envelope.acks {
                    let _ = ack.send(result.clone());
                }
            }
        }
        debug!("sync queue closed");
    }
}

type Ack = oneshot::Sender<Result<SyncOutcome, SyncError>>;

struct Envelope {
    change: CatalogChange,
    acks: Vec<Ack>,
}

/// Within each run of product events, keep only the latest event per
/// product at the position of its last occurrence. Category events are
/// barriers and never move.
fn coalesce(batch: Vec<Envelope>) -> Vec<Envelope> {
    let mut out: Vec<Envelope> = Vec::with_capacity(batch.len());
    let mut run_start = 0;
    for mut envelope in batch {
        let Some(id) = envelope.change.product_id().map(str::to_string) else {
            out.push(envelope);
            run_start = out.len();
            continue;
        };
        let earlier = out[run_start..]
            .iter()
            .position(|e| e.change.product_id() == Some(id.as_str()));
        if let Some(pos) = earlier {
            let mut acks = out.remove(run_start + pos).acks;
            acks.append(&mut envelope.acks);
            envelope.acks = acks;
        }
        out.push(envelope);
    }
    out
}

/// Cheap cloneable entrypoint into the dispatcher.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Envelope>,
}

impl SyncHandle {
    /// Queue an event and wait until it has been applied (or failed).
    pub async fn notify_catalog_change(&self, change: CatalogChange) -> Result<SyncOutcome, SyncError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Envelope { change, acks: vec![ack] })
            .await
            .map_err(|_| SyncError::QueueClosed)?;
        rx.await.map_err(|_| SyncError::QueueClosed)?
    }

    /// Queue an event without waiting for it.
    pub async fn enqueue(&self, change: CatalogChange) -> Result<(), SyncError> {
        self.tx
            .send(Envelope { change, acks: Vec::new() })
            .await
            .map_err(|_| SyncError::QueueClosed)
    }
}
