//! Candidate retrieval engines behind the planner.
//!
//! [`IndexBackend`] answers from the inverted index. [`SubstringBackend`]
//! answers by scanning the catalog and is used whenever the index is
//! unhealthy or a read fails. Both hand back the same [`CandidateSet`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::catalog::CatalogReader;
use crate::config::HighlightConfig;
use crate::error::{IndexError, SearchError};
use crate::index::Document;
use crate::models::Product;
use crate::query::ParsedQuery;
use crate::snippet::snippet;
use crate::store::{Index, SearchOptions};
use crate::tokenizer::{fold, fold_text, MIN_TOKEN_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub product_id: String,
    /// BM25 rank from the index; the substring engine has none.
    pub rank: Option<f64>,
    pub name_highlight: String,
    pub description_highlight: String,
}

#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Best first, at most the requested limit.
    pub candidates: Vec<Candidate>,
    /// All matches, regardless of limit.
    pub total: usize,
    pub engine: Engine,
}

impl CandidateSet {
    /// True when every match is in `candidates`.
    pub fn is_exhaustive(&self) -> bool {
        self.candidates.len() >= self.total
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn engine(&self) -> Engine;

    fn is_healthy(&self) -> bool;

    async fn candidates(&self, query: &ParsedQuery, limit: usize) -> Result<CandidateSet, SearchError>;
}

pub struct IndexBackend {
    index: Arc<dyn Index>,
}

impl IndexBackend {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl SearchBackend for IndexBackend {
    fn engine(&self) -> Engine {
        Engine::Primary
    }

    fn is_healthy(&self) -> bool {
        self.index.is_available()
    }

    async fn candidates(&self, query: &ParsedQuery, limit: usize) -> Result<CandidateSet, SearchError> {
        let index = self.index.clone();
        let q = query.query.clone();
        let opts = SearchOptions { limit, offset: 0, min_rank: None };
        let page = tokio::task::spawn_blocking(move || index.search(&q, opts))
            .await
            .map_err(|e| IndexError::Unavailable(format!("search task failed: {e}")))??;
        let candidates = page
            .hits
            .into_iter()
            .map(|h| Candidate {
                product_id: h.product_id,
                rank: Some(h.rank),
                name_highlight: h.name_highlight,
                description_highlight: h.description_highlight,
            })
            .collect();
        Ok(CandidateSet { candidates, total: page.total, engine: Engine::Primary })
    }
}

/// Case-insensitive substring matching over the catalog, ranked by
/// `(rating desc, sales_count desc)`.
pub struct SubstringBackend {
    catalog: Arc<dyn CatalogReader>,
    highlight: HighlightConfig,
    batch_size: usize,
}

impl SubstringBackend {
    pub fn new(catalog: Arc<dyn CatalogReader>, highlight: HighlightConfig, batch_size: usize) -> Self {
        Self { catalog, highlight, batch_size: batch_size.max(1) }
    }

    fn highlight(&self, text: &str, max_tokens: usize, needles: &[String]) -> String {
        snippet(text, max_tokens, &self.highlight, |t| {
            let word = fold(&text[t.start..t.end]);
            needles.iter().any(|n| word.contains(n.as_str()))
        })
    }
}

/// The query's stemmed tokens plus its folded words; either may appear
/// inside a field.
fn needles(query: &ParsedQuery) -> Vec<String> {
    let mut out: Vec<String> = query.tokens.clone();
    for word in fold_text(&query.text).split(' ') {
        if word.chars().count() >= MIN_TOKEN_CHARS && !out.iter().any(|n| n == word) {
            out.push(word.to_string());
        }
    }
    out
}

fn haystack(product: &Product) -> String {
    format!(
        "{} {} {}",
        fold_text(&product.name),
        fold_text(&product.description),
        fold_text(&product.short_description)
    )
}

/// Fallback ordering; ties break on id so pages are stable.
pub fn fallback_order(a: &Product, b: &Product) -> std::cmp::Ordering {
    b.rating
        .total_cmp(&a.rating)
        .then(b.sales_count.cmp(&a.sales_count))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl SearchBackend for SubstringBackend {
    fn engine(&self) -> Engine {
        Engine::Fallback
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn candidates(&self, query: &ParsedQuery, limit: usize) -> Result<CandidateSet, SearchError> {
        let needles = needles(query);
        if needles.is_empty() {
            return Ok(CandidateSet { candidates: Vec::new(), total: 0, engine: Engine::Fallback });
        }

        let mut matched: Vec<Product> = Vec::new();
        let mut offset = 0;
        loop {
            let batch = self.catalog.active_products(offset, self.batch_size).await?;
            let fetched = batch.len();
            matched.extend(batch.into_iter().filter(|p| {
                let hay = haystack(p);
                needles.iter().any(|n| hay.contains(n.as_str()))
            }));
            offset += fetched;
            if fetched < self.batch_size {
                break;
            }
        }
        matched.sort_by(fallback_order);
        let total = matched.len();

        let candidates = matched
            .into_iter()
            .take(limit)
            .map(|p| {
                let doc = Document::from_product(&p, None);
                Candidate {
                    name_highlight: self.highlight(&doc.name, self.highlight.name_tokens, &needles),
                    description_highlight: self.highlight(
                        &doc.description,
                        self.highlight.description_tokens,
                        &needles,
                    ),
                    product_id: p.id,
                    rank: None,
                }
            })
            .collect();
        Ok(CandidateSet { candidates, total, engine: Engine::Fallback })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::QueryConfig;

    fn product(id: &str, name: &str, rating: f64, sales: u64) -> Product {
        serde_json::from_value(serde_json::json!({
            "id": id, "vendor_id": "v1", "name": name, "price": 10.0,
            "rating": rating, "sales_count": sales
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn substring_engine_ranks_by_rating_then_sales() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_product(product("a", "Studio Headphones", 4.0, 10));
        catalog.upsert_product(product("b", "Wireless Headphones", 4.5, 1));
        catalog.upsert_product(product("c", "Bass Headphones", 4.0, 99));
        catalog.upsert_product(product("d", "Desk Lamp", 5.0, 99));
        let backend = SubstringBackend::new(Arc::new(catalog), HighlightConfig::default(), 2);

        let q = ParsedQuery::parse("headphones", &QueryConfig::default()).unwrap();
        let set = backend.candidates(&q, 10).await.unwrap();
        let ids: Vec<&str> = set.candidates.iter().map(|c| c.product_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(set.total, 3);
        assert_eq!(set.engine, Engine::Fallback);
        assert!(set.candidates[0].name_highlight.contains("<mark>Headphones</mark>"));
    }

    #[tokio::test]
    async fn substring_engine_limits_but_counts_all() {
        let catalog = MemoryCatalog::new();
        for i in 0..5 {
            catalog.upsert_product(product(&format!("p{i}"), "Oak Desk", 4.0, i));
        }
        let backend = SubstringBackend::new(Arc::new(catalog), HighlightConfig::default(), 100);
        let q = ParsedQuery::parse("desk", &QueryConfig::default()).unwrap();
        let set = backend.candidates(&q, 2).await.unwrap();
        assert_eq!(set.candidates.len(), 2);
        assert_eq!(set.total, 5);
        assert!(!set.is_exhaustive());
    }
}
