//! The Index Store: a persistent inverted index over catalog documents.
//!
//! Readers share a read lock on the in-memory index and never see a
//! half-applied document. Writers are serialized by a separate mutex, so
//! `rebuild` and `optimize` can build a shadow copy while searches keep
//! running and only take the write lock for the final swap.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::{HighlightConfig, IndexConfig, RankingConfig};
use crate::error::IndexError;
use crate::index::{Document, Field, InvertedIndex};
use crate::persist::{DocumentStore, IndexPaths, SCHEMA_VERSION};
use crate::query::Query;
use crate::snippet::snippet;

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    /// Absolute cutoff; hits with a rank above it are dropped.
    pub min_rank: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub product_id: String,
    /// BM25 rank; more negative is more relevant.
    pub rank: f64,
    pub name_highlight: String,
    pub description_highlight: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<Hit>,
    /// Matches before `offset`/`limit` were applied.
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub segments: usize,
    pub deleted: usize,
    pub size_bytes: u64,
    pub schema_version: Option<u32>,
    pub available: bool,
}

/// The index contract the sync engine writes to and the planner reads from.
pub trait Index: Send + Sync {
    /// Insert or atomically replace the document for `doc.product_id`.
    fn upsert(&self, doc: Document) -> Result<(), IndexError>;
    /// Remove a document; `Ok(false)` when it was not indexed.
    fn remove(&self, product_id: &str) -> Result<bool, IndexError>;
    fn search(&self, query: &Query, opts: SearchOptions) -> Result<SearchPage, IndexError>;
    /// Re-derive all postings from the stored documents.
    fn rebuild(&self) -> Result<usize, IndexError>;
    /// Merge segments; never changes query results.
    fn optimize(&self) -> Result<(), IndexError>;
    /// Swap in a complete new document set.
    fn replace_all(&self, docs: Vec<Document>) -> Result<usize, IndexError>;
    fn document(&self, product_id: &str) -> Option<Document>;
    fn stats(&self) -> Result<IndexStats, IndexError>;
    fn is_available(&self) -> bool;
}

pub struct IndexStore {
    inner: RwLock<InvertedIndex>,
    writer: Mutex<()>,
    storage: DocumentStore,
    available: AtomicBool,
    ranking: RankingConfig,
    highlight: HighlightConfig,
    segment_max_docs: usize,
    schema_version: RwLock<Option<u32>>,
}

impl IndexStore {
    /// Open the index under `config.path`, loading persisted documents.
    pub fn open(config: &IndexConfig, ranking: RankingConfig, highlight: HighlightConfig) -> Result<Self, IndexError> {
        let storage = DocumentStore::open(&IndexPaths::new(&config.path))?;
        Self::with_storage(storage, config.segment_max_docs, ranking, highlight)
    }

    pub fn temporary(config: &IndexConfig, ranking: RankingConfig, highlight: HighlightConfig) -> Result<Self, IndexError> {
        Self::with_storage(DocumentStore::temporary()?, config.segment_max_docs, ranking, highlight)
    }

    fn with_storage(
        storage: DocumentStore,
        segment_max_docs: usize,
        ranking: RankingConfig,
        highlight: HighlightConfig,
    ) -> Result<Self, IndexError> {
        let docs = storage.load_documents()?;
        let schema_version = storage.load_meta()?.map(|m| m.version);
        let index = InvertedIndex::from_documents(docs, segment_max_docs);
        info!(documents = index.len(), ?schema_version, "search index opened");
        Ok(Self {
            inner: RwLock::new(index),
            writer: Mutex::new(()),
            storage,
            available: AtomicBool::new(true),
            ranking,
            highlight,
            segment_max_docs,
            schema_version: RwLock::new(schema_version),
        })
    }

    /// Flip the liveness marker. An unavailable index refuses reads, which
    /// routes searches to the substring engine.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn swap(&self, next: InvertedIndex) {
        *self.inner.write() = next;
    }
}

impl Index for IndexStore {
    fn upsert(&self, doc: Document) -> Result<(), IndexError> {
        let _w = self.writer.lock();
        self.storage.put(&doc).map_err(|e| IndexError::write(&doc.product_id, e))?;
        debug!(product_id = %doc.product_id, "document upserted");
        self.inner.write().insert(doc);
        Ok(())
    }

    fn remove(&self, product_id: &str) -> Result<bool, IndexError> {
        let _w = self.writer.lock();
        self.storage.delete(product_id).map_err(|e| IndexError::write(product_id, e))?;
        let removed = self.inner.write().delete(product_id);
        debug!(product_id, removed, "document removed");
        Ok(removed)
    }

    fn search(&self, query: &Query, opts: SearchOptions) -> Result<SearchPage, IndexError> {
        if !self.is_available() {
            return Err(IndexError::Unavailable("index marked unavailable".to_string()));
        }
        let index = self.inner.read();
        let matches = index.search(query, &self.ranking, opts.min_rank);
        let total = matches.hits.len();
        let terms = &matches.matched_terms;
        let hits = matches
            .hits
            .iter()
            .skip(opts.offset)
            .take(opts.limit)
            .filter_map(|(addr, rank)| {
                let doc = index.document_at(*addr)?;
                let is_match = |t: &crate::tokenizer::Token| terms.contains(&t.term);
                Some(Hit {
                    product_id: doc.product_id.clone(),
                    rank: *rank,
                    name_highlight: snippet(
                        &doc.field_text(Field::Name),
                        self.highlight.name_tokens,
                        &self.highlight,
                        is_match,
                    ),
                    description_highlight: snippet(
                        &doc.field_text(Field::Description),
                        self.highlight.description_tokens,
                        &self.highlight,
                        is_match,
                    ),
                })
            })
            .collect();
        Ok(SearchPage { hits, total })
    }

    fn rebuild(&self) -> Result<usize, IndexError> {
        let _w = self.writer.lock();
        let shadow = {
            let current = self.inner.read();
            InvertedIndex::from_documents(current.documents().cloned(), self.segment_max_docs)
        };
        let count = shadow.len();
        self.storage.save_meta(count)?;
        self.swap(shadow);
        *self.schema_version.write() = Some(SCHEMA_VERSION);
        info!(documents = count, "search index rebuilt");
        Ok(count)
    }

    fn optimize(&self) -> Result<(), IndexError> {
        let _w = self.writer.lock();
        let (shadow, before) = {
            let current = self.inner.read();
            (current.merged(), current.segment_count())
        };
        self.swap(shadow);
        self.storage.flush()?;
        info!(segments_before = before, "search index optimized");
        Ok(())
    }

    fn replace_all(&self, docs: Vec<Document>) -> Result<usize, IndexError> {
        let _w = self.writer.lock();
        self.storage.replace_all(&docs)?;
        let shadow = InvertedIndex::from_documents(docs, self.segment_max_docs);
        let count = shadow.len();
        self.swap(shadow);
        *self.schema_version.write() = Some(SCHEMA_VERSION);
        Ok(count)
    }

    fn document(&self, product_id: &str) -> Option<Document> {
        self.inner.read().get(product_id).cloned()
    }

    fn stats(&self) -> Result<IndexStats, IndexError> {
        let index = self.inner.read();
        Ok(IndexStats {
            documents: index.len(),
            segments: index.segment_count(),
            deleted: index.deleted_count(),
            size_bytes: self.storage.size_on_disk(),
            schema_version: *self.schema_version.read(),
            available: self.is_available(),
        })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
