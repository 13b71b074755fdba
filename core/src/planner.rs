//! The Query Planner: parse, retrieve, join, filter, order, paginate.
//!
//! Retrieval goes through a [`SearchBackend`]. The index answers when it is
//! healthy; any index fault switches the request to the substring engine
//! and the caller sees the same response shape either way.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::analytics::{AnalyticsRecorder, ClientMeta, PopularQuery, SearchEvent};
use crate::backend::{Candidate, CandidateSet, Engine, IndexBackend, SearchBackend, SubstringBackend};
use crate::catalog::CatalogReader;
use crate::config::{QueryConfig, SearchConfig};
use crate::error::SearchError;
use crate::filter::{AppliedFilters, FilterPredicate, SortMode};
use crate::models::{Category, Product, Vendor};
use crate::query::ParsedQuery;
use crate::store::Index;
use crate::suggest::{correct, vocabulary};
use crate::tokenizer::{fold_text, MIN_TOKEN_CHARS};

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub q: Option<String>,
    pub filters: AppliedFilters,
    pub sort: SortMode,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
    pub page: usize,
}

impl Pagination {
    /// Accepts `(page, page_size)` or `(offset, limit)`; the latter wins
    /// when both are present.
    pub fn resolve(request: &SearchRequest, config: &QueryConfig) -> Self {
        let clamp = |n: usize| n.clamp(1, config.max_page_size);
        if request.offset.is_some() || request.limit.is_some() {
            let limit = clamp(request.limit.or(request.page_size).unwrap_or(config.default_page_size));
            let offset = request.offset.unwrap_or(0);
            return Self { offset, limit, page: (offset / limit).saturating_add(1) };
        }
        let limit = clamp(request.page_size.unwrap_or(config.default_page_size));
        let page = request.page.unwrap_or(1).max(1);
        Self { offset: (page - 1).saturating_mul(limit), limit, page }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductHit {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub price: f64,
    pub compare_at_price: Option<f64>,
    pub rating: f64,
    pub review_count: u32,
    pub sales_count: u64,
    pub in_stock: bool,
    pub on_sale: bool,
    pub vendor_id: String,
    pub category_id: Option<String>,
    pub image_url: Option<String>,
    /// BM25 rank when the index answered; null otherwise.
    pub rank: Option<f64>,
    pub name_highlight: String,
    pub description_highlight: String,
}

impl ProductHit {
    fn new(p: Product, candidate: Option<Candidate>) -> Self {
        let (rank, name_highlight, description_highlight) = match candidate {
            Some(c) => (c.rank, c.name_highlight, c.description_highlight),
            None => {
                let blurb = if p.short_description.is_empty() {
                    p.description.clone()
                } else {
                    p.short_description.clone()
                };
                (None, p.name.clone(), blurb)
            }
        };
        Self {
            in_stock: p.in_stock(),
            on_sale: p.on_sale(),
            id: p.id,
            name: p.name,
            slug: p.slug,
            price: p.price,
            compare_at_price: p.compare_at_price,
            rating: p.rating,
            review_count: p.review_count,
            sales_count: p.sales_count,
            vendor_id: p.vendor_id,
            category_id: p.category_id,
            image_url: p.image_url,
            rank,
            name_highlight,
            description_highlight,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductSearchResponse {
    pub products: Vec<ProductHit>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub filters: AppliedFilters,
    pub sort: SortMode,
    pub query: String,
    pub engine: Engine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_you_mean: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickSearchResponse {
    pub products: Vec<ProductHit>,
    pub categories: Vec<Category>,
    pub vendors: Vec<Vendor>,
    pub total_results: usize,
    pub query: String,
    pub engine: Engine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutocompleteResponse {
    pub suggestions: Vec<String>,
    pub categories: Vec<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_you_mean: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryPopularity {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub product_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendingResponse {
    pub trending: Vec<ProductHit>,
    pub popular_searches: Vec<PopularQuery>,
    pub popular_categories: Vec<CategoryPopularity>,
}

struct Page {
    hits: Vec<ProductHit>,
    total: usize,
    engine: Engine,
}

impl Page {
    fn empty(engine: Engine) -> Self {
        Self { hits: Vec::new(), total: 0, engine }
    }
}

pub struct QueryPlanner {
    primary: Arc<dyn SearchBackend>,
    fallback: Arc<dyn SearchBackend>,
    catalog: Arc<dyn CatalogReader>,
    analytics: Option<Arc<AnalyticsRecorder>>,
    config: SearchConfig,
}

impl QueryPlanner {
    pub fn new(
        index: Arc<dyn Index>,
        catalog: Arc<dyn CatalogReader>,
        analytics: Option<Arc<AnalyticsRecorder>>,
        config: SearchConfig,
    ) -> Self {
        let primary = Arc::new(IndexBackend::new(index));
        let fallback = Arc::new(SubstringBackend::new(
            catalog.clone(),
            config.highlight.clone(),
            config.sync.rebuild_batch_size,
        ));
        Self::with_backends(primary, fallback, catalog, analytics, config)
    }

    pub fn with_backends(
        primary: Arc<dyn SearchBackend>,
        fallback: Arc<dyn SearchBackend>,
        catalog: Arc<dyn CatalogReader>,
        analytics: Option<Arc<AnalyticsRecorder>>,
        config: SearchConfig,
    ) -> Self {
        Self { primary, fallback, catalog, analytics, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn analytics(&self) -> Option<&Arc<AnalyticsRecorder>> {
        self.analytics.as_ref()
    }

    /// The engine a search issued now would start with.
    pub fn active_engine(&self) -> Engine {
        if self.primary.is_healthy() {
            self.primary.engine()
        } else {
            self.fallback.engine()
        }
    }

    /// Blank input means "no text query"; input that sanitizes down to
    /// nothing searchable is rejected.
    fn parse(&self, raw: Option<&str>) -> Result<Option<ParsedQuery>, SearchError> {
        let raw = raw.unwrap_or_default();
        if raw.trim().is_empty() {
            return Ok(None);
        }
        ParsedQuery::parse(raw, &self.config.query)
            .map(Some)
            .ok_or_else(|| SearchError::Validation("query contains no searchable terms".to_string()))
    }

    /// `GET /search/products`.
    #[instrument(skip_all, fields(sort = ?request.sort))]
    pub async fn search_products(
        &self,
        request: SearchRequest,
        client: ClientMeta,
    ) -> Result<ProductSearchResponse, SearchError> {
        let started = Instant::now();
        request.filters.validate()?;
        let parsed = self.parse(request.q.as_deref())?;
        let paging = Pagination::resolve(&request, &self.config.query);

        let deadline = self.config.query.deadline();
        let page = tokio::time::timeout(
            deadline,
            self.execute(parsed.as_ref(), &request.filters, request.sort, paging.offset, paging.limit),
        )
        .await
        .map_err(|_| SearchError::Timeout(deadline))??;

        let did_you_mean = match &parsed {
            Some(q) if page.total == 0 => {
                let budget = deadline.saturating_sub(started.elapsed());
                self.did_you_mean_within(&q.text, budget).await
            }
            _ => None,
        };
        let query_id = match (&parsed, request.q.as_deref()) {
            (Some(_), Some(raw)) => self.record(raw, page.total, started, &request.filters, client),
            _ => None,
        };
        debug!(total = page.total, engine = ?page.engine, "product search done");

        Ok(ProductSearchResponse {
            total_pages: page.total.div_ceil(paging.limit),
            products: page.hits,
            total: page.total,
            page: paging.page,
            page_size: paging.limit,
            filters: request.filters,
            sort: request.sort,
            query: parsed.map(|q| q.text).unwrap_or_default(),
            engine: page.engine,
            query_id,
            did_you_mean,
        })
    }

    /// `GET /search`: products plus matching categories and vendors.
    #[instrument(skip_all)]
    pub async fn quick_search(
        &self,
        raw: &str,
        limit: usize,
        client: ClientMeta,
    ) -> Result<QuickSearchResponse, SearchError> {
        let started = Instant::now();
        let Some(parsed) = self.parse(Some(raw))? else {
            return Ok(QuickSearchResponse {
                products: Vec::new(),
                categories: Vec::new(),
                vendors: Vec::new(),
                total_results: 0,
                query: String::new(),
                engine: self.active_engine(),
                query_id: None,
            });
        };
        let limit = limit.clamp(1, self.config.query.max_page_size);
        let deadline = self.config.query.deadline();
        let (page, categories, vendors) = tokio::time::timeout(deadline, async {
            let page = self.execute(Some(&parsed), &AppliedFilters::default(), SortMode::Relevance, 0, limit).await?;
            let categories = self.matching_categories(&parsed.text, self.config.suggest.max_categories).await?;
            let vendors = self.matching_vendors(&parsed.text, limit).await?;
            Ok::<_, SearchError>((page, categories, vendors))
        })
        .await
        .map_err(|_| SearchError::Timeout(deadline))??;

        let total_results = page.total + categories.len() + vendors.len();
        let query_id = self.record(raw, total_results, started, &AppliedFilters::default(), client);
        Ok(QuickSearchResponse {
            products: page.hits,
            categories,
            vendors,
            total_results,
            query: parsed.text,
            engine: page.engine,
            query_id,
        })
    }

    /// `GET /search/autocomplete`: product names for a prefix, best sellers
    /// first. Falls back to a did-you-mean when nothing matches.
    #[instrument(skip_all)]
    pub async fn autocomplete(&self, raw: &str, limit: usize) -> Result<AutocompleteResponse, SearchError> {
        let started = Instant::now();
        let Some(parsed) = ParsedQuery::parse_prefix(raw, &self.config.query) else {
            return Ok(AutocompleteResponse::default());
        };
        let limit = limit.clamp(1, self.config.query.max_page_size);
        let deadline = self.config.query.deadline();
        let (suggestions, categories) = tokio::time::timeout(deadline, async {
            let set = self.fetch_candidates(&parsed, self.config.query.max_candidates).await?;
            let mut rows = self.join(set.candidates, &FilterPredicate::default()).await?;
            rows.sort_by(|(_, a), (_, b)| {
                b.sales_count
                    .cmp(&a.sales_count)
                    .then(b.rating.total_cmp(&a.rating))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let mut seen = HashSet::new();
            let suggestions: Vec<String> = rows
                .into_iter()
                .map(|(_, p)| p.name)
                .filter(|name| seen.insert(fold_text(name)))
                .take(limit)
                .collect();
            let categories = self.matching_categories(&parsed.text, self.config.suggest.max_categories).await?;
            Ok::<_, SearchError>((suggestions, categories))
        })
        .await
        .map_err(|_| SearchError::Timeout(deadline))??;

        let did_you_mean = if suggestions.is_empty() {
            self.did_you_mean_within(&parsed.text, deadline.saturating_sub(started.elapsed())).await
        } else {
            None
        };
        Ok(AutocompleteResponse { suggestions, categories, did_you_mean })
    }

    /// `GET /search/trending`.
    pub async fn trending(&self, limit: usize) -> Result<TrendingResponse, SearchError> {
        let limit = limit.clamp(1, self.config.query.max_page_size);
        let trending = self
            .catalog
            .top_products(limit)
            .await?
            .into_iter()
            .map(|p| ProductHit::new(p, None))
            .collect();

        let popular_searches = match &self.analytics {
            Some(analytics) => analytics
                .popular(self.config.analytics.popular_window(), limit)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "popular searches unavailable");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let mut popular_categories = Vec::new();
        for category in self.catalog.categories().await? {
            let product_count = self
                .catalog
                .products_in_category(&category.id)
                .await?
                .iter()
                .filter(|p| p.is_active())
                .count();
            if product_count > 0 {
                popular_categories.push(CategoryPopularity {
                    id: category.id,
                    name: category.name,
                    slug: category.slug,
                    product_count,
                });
            }
        }
        popular_categories.sort_by(|a, b| b.product_count.cmp(&a.product_count).then_with(|| a.name.cmp(&b.name)));
        popular_categories.truncate(limit);

        Ok(TrendingResponse { trending, popular_searches, popular_categories })
    }

    /// Best-effort spelling correction against top product and category
    /// names. Any failure means no suggestion.
    pub async fn did_you_mean(&self, text: &str) -> Option<String> {
        let products = match self.catalog.top_products(self.config.suggest.candidate_pool).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "did-you-mean skipped");
                return None;
            }
        };
        let categories = self.catalog.categories().await.unwrap_or_default();
        let vocab = vocabulary(
            products
                .iter()
                .map(|p| p.name.as_str())
                .chain(categories.iter().map(|c| c.name.as_str())),
        );
        correct(text, &vocab, self.config.suggest.min_confidence).map(|c| c.text)
    }

    /// The suggestion gets whatever is left of the request deadline; running
    /// out means no suggestion rather than a failed search.
    async fn did_you_mean_within(&self, text: &str, budget: Duration) -> Option<String> {
        match tokio::time::timeout(budget, self.did_you_mean(text)).await {
            Ok(suggestion) => suggestion,
            Err(_) => {
                debug!(budget_ms = budget.as_millis() as u64, "did-you-mean ran out of time");
                None
            }
        }
    }

    async fn execute(
        &self,
        parsed: Option<&ParsedQuery>,
        filters: &AppliedFilters,
        sort: SortMode,
        offset: usize,
        limit: usize,
    ) -> Result<Page, SearchError> {
        if parsed.is_none() && sort == SortMode::Relevance {
            return Ok(Page::empty(self.active_engine()));
        }
        let Some(predicate) = FilterPredicate::resolve(filters, self.catalog.as_ref()).await? else {
            return Ok(Page::empty(self.active_engine()));
        };
        match parsed {
            Some(q) => self.ranked(q, &predicate, sort, offset, limit).await,
            None => self.browse(&predicate, sort, offset, limit).await,
        }
    }

    /// No text query: scan the catalog with the filter predicate.
    async fn browse(
        &self,
        predicate: &FilterPredicate,
        sort: SortMode,
        offset: usize,
        limit: usize,
    ) -> Result<Page, SearchError> {
        let batch_size = self.config.sync.rebuild_batch_size.max(1);
        let mut rows = Vec::new();
        let mut cursor = 0;
        loop {
            let batch = self.catalog.active_products(cursor, batch_size).await?;
            let fetched = batch.len();
            rows.extend(batch.into_iter().filter(|p| predicate.matches(p)));
            cursor += fetched;
            if fetched < batch_size {
                break;
            }
        }
        rows.sort_by(|a, b| sort.compare(a, b));
        let total = rows.len();
        let hits = rows.into_iter().skip(offset).take(limit).map(|p| ProductHit::new(p, None)).collect();
        Ok(Page { hits, total, engine: Engine::Primary })
    }

    /// Text query: over-fetch ranked candidates, join, filter, and widen the
    /// window until the page and its total are settled.
    async fn ranked(
        &self,
        parsed: &ParsedQuery,
        predicate: &FilterPredicate,
        sort: SortMode,
        offset: usize,
        limit: usize,
    ) -> Result<Page, SearchError> {
        let need = offset.saturating_add(limit);
        let cap = self.config.query.max_candidates.max(need);
        // With no filters and rank order, a full page is enough and the
        // index total is exact up to rows dropped by the join. Anything else
        // needs every match before the total and the order are known.
        let settles_early = predicate.is_trivial() && sort == SortMode::Relevance;
        let mut window = need.saturating_mul(self.config.query.overfetch_factor).clamp(need.max(1), cap);

        loop {
            let set = self.fetch_candidates(parsed, window).await?;
            let (fetched, reported, engine) = (set.candidates.len(), set.total, set.engine);
            let exhaustive = set.is_exhaustive();
            let mut rows = self.join(set.candidates, predicate).await?;

            if exhaustive || (settles_early && (window >= cap || rows.len() >= need)) {
                let total = if exhaustive { rows.len() } else { reported.saturating_sub(fetched - rows.len()) };
                if sort != SortMode::Relevance {
                    rows.sort_by(|(_, a), (_, b)| sort.compare(a, b));
                }
                let hits = rows
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(c, p)| ProductHit::new(p, Some(c)))
                    .collect();
                return Ok(Page { hits, total, engine });
            }
            debug!(window, survivors = rows.len(), reported, "widening candidate window");
            // Past the cap only an exhaustive fetch settles a filtered or
            // re-sorted result, so ask for everything the engine reported.
            window = if window >= cap {
                reported.max(window.saturating_add(1))
            } else {
                window.saturating_mul(2).min(cap)
            };
        }
    }

    async fn fetch_candidates(&self, parsed: &ParsedQuery, limit: usize) -> Result<CandidateSet, SearchError> {
        if self.primary.is_healthy() {
            match self.primary.candidates(parsed, limit).await {
                Ok(set) => return Ok(set),
                Err(e) => warn!(error = %e, query = %parsed.text, "index search failed; using substring engine"),
            }
        } else {
            warn!(query = %parsed.text, "index unavailable; using substring engine");
        }
        self.fallback.candidates(parsed, limit).await
    }

    /// Join candidates to catalog rows in one batch, keeping rank order.
    async fn join(
        &self,
        candidates: Vec<Candidate>,
        predicate: &FilterPredicate,
    ) -> Result<Vec<(Candidate, Product)>, SearchError> {
        let ids: Vec<String> = candidates.iter().map(|c| c.product_id.clone()).collect();
        let mut by_id: HashMap<String, Product> = self
            .catalog
            .products_by_ids(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Ok(candidates
            .into_iter()
            .filter_map(|c| {
                let p = by_id.remove(&c.product_id)?;
                predicate.matches(&p).then_some((c, p))
            })
            .collect())
    }

    async fn matching_categories(&self, text: &str, limit: usize) -> Result<Vec<Category>, SearchError> {
        let words = query_words(text);
        Ok(self
            .catalog
            .categories()
            .await?
            .into_iter()
            .filter(|c| name_matches(&c.name, &words))
            .take(limit)
            .collect())
    }

    async fn matching_vendors(&self, text: &str, limit: usize) -> Result<Vec<Vendor>, SearchError> {
        let words = query_words(text);
        Ok(self
            .catalog
            .vendors()
            .await?
            .into_iter()
            .filter(|v| name_matches(&v.name, &words))
            .take(limit)
            .collect())
    }

    /// Hand the search to the recorder without waiting for the write.
    fn record(
        &self,
        raw: &str,
        results_count: usize,
        started: Instant,
        filters: &AppliedFilters,
        client: ClientMeta,
    ) -> Option<u64> {
        let analytics = self.analytics.clone()?;
        let id = match analytics.next_id() {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "analytics unavailable; search not recorded");
                return None;
            }
        };
        let event = SearchEvent {
            query: raw.to_string(),
            results_count,
            search_time_ms: started.elapsed().as_millis() as u64,
            filters: filters.clone(),
            client,
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = analytics.record(id, event) {
                warn!(error = %e, "failed to record search");
            }
        });
        Some(id)
    }
}

fn query_words(text: &str) -> Vec<String> {
    fold_text(text)
        .split(' ')
        .filter(|w| w.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

fn name_matches(name: &str, words: &[String]) -> bool {
    let folded = fold_text(name);
    words.iter().any(|w| folded.contains(w.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_by_page() {
        let config = QueryConfig::default();
        let req = SearchRequest { page: Some(3), page_size: Some(10), ..Default::default() };
        assert_eq!(Pagination::resolve(&req, &config), Pagination { offset: 20, limit: 10, page: 3 });
    }

    #[test]
    fn pagination_by_offset_and_clamped() {
        let config = QueryConfig::default();
        let req = SearchRequest { offset: Some(45), limit: Some(500), ..Default::default() };
        assert_eq!(Pagination::resolve(&req, &config), Pagination { offset: 45, limit: 100, page: 1 });
        let req = SearchRequest { page: Some(0), page_size: Some(0), ..Default::default() };
        assert_eq!(Pagination::resolve(&req, &config), Pagination { offset: 0, limit: 1, page: 1 });
    }

    #[test]
    fn pagination_saturates_at_the_edges() {
        let config = QueryConfig::default();
        let req = SearchRequest { offset: Some(usize::MAX), limit: Some(1), ..Default::default() };
        assert_eq!(Pagination::resolve(&req, &config).page, usize::MAX);
        let req = SearchRequest { page: Some(usize::MAX), page_size: Some(10), ..Default::default() };
        assert_eq!(Pagination::resolve(&req, &config).offset, usize::MAX);
    }

    #[test]
    fn category_words_match_folded_names() {
        let words = query_words("Café lamps");
        assert!(name_matches("Cafe Furniture", &words));
        assert!(name_matches("Desk Lamps", &words));
        assert!(!name_matches("Audio", &words));
    }
}
