//! Structured post-filters and sort modes for product search.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::catalog::CatalogReader;
use crate::error::SearchError;
use crate::models::Product;

/// The filters a caller asked for. This one shape is what responses echo
/// back and what analytics persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedFilters {
    /// Category slug; matches the category and all its descendants.
    pub category: Option<String>,
    /// Comma-separated vendor slugs or ids.
    pub vendor: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub in_stock: bool,
    #[serde(default)]
    pub on_sale: bool,
}

impl AppliedFilters {
    pub fn is_empty(&self) -> bool {
        self == &AppliedFilters::default()
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        for (name, value) in [("min_price", self.min_price), ("max_price", self.max_price)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(SearchError::Validation(format!("{name} must be a non-negative number")));
                }
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_price, self.max_price) {
            if lo > hi {
                return Err(SearchError::Validation("min_price exceeds max_price".to_string()));
            }
        }
        if let Some(r) = self.min_rating {
            if !(0.0..=5.0).contains(&r) {
                return Err(SearchError::Validation("rating must be between 0 and 5".to_string()));
            }
        }
        Ok(())
    }
}

/// Filters resolved against the catalog into a plain row predicate.
#[derive(Debug, Clone, Default)]
pub struct FilterPredicate {
    categories: Option<HashSet<String>>,
    vendors: Option<HashSet<String>>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    min_rating: Option<f64>,
    in_stock: bool,
    on_sale: bool,
}

impl FilterPredicate {
    /// `Ok(None)` when a slug names nothing: the result is empty rather
    /// than an error, so filters do not reveal what exists.
    pub async fn resolve(
        filters: &AppliedFilters,
        catalog: &dyn CatalogReader,
    ) -> Result<Option<Self>, SearchError> {
        let categories = match filters.category.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(slug) => match catalog.category_by_slug(slug).await? {
                Some(category) => Some(catalog.category_subtree(&category.id).await?.into_iter().collect()),
                None => return Ok(None),
            },
            None => None,
        };

        let vendors = match filters.vendor.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(list) => {
                let known = catalog.vendors().await?;
                let mut ids = HashSet::new();
                for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if let Some(v) = catalog.vendor_by_slug(entry).await? {
                        ids.insert(v.id);
                    } else if known.iter().any(|v| v.id == entry) {
                        ids.insert(entry.to_string());
                    }
                }
                if ids.is_empty() {
                    return Ok(None);
                }
                Some(ids)
            }
            None => None,
        };

        Ok(Some(Self {
            categories,
            vendors,
            min_price: filters.min_price,
            max_price: filters.max_price,
            min_rating: filters.min_rating,
            in_stock: filters.in_stock,
            on_sale: filters.on_sale,
        }))
    }

    /// True when only the implicit active-status check applies.
    pub fn is_trivial(&self) -> bool {
        self.categories.is_none()
            && self.vendors.is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.min_rating.is_none()
            && !self.in_stock
            && !self.on_sale
    }

    pub fn matches(&self, p: &Product) -> bool {
        if !p.is_active() {
            return false;
        }
        if let Some(ids) = &self.categories {
            match &p.category_id {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.vendors {
            if !ids.contains(&p.vendor_id) {
                return false;
            }
        }
        if self.min_price.is_some_and(|lo| p.price < lo) || self.max_price.is_some_and(|hi| p.price > hi) {
            return false;
        }
        if self.min_rating.is_some_and(|r| p.rating < r) {
            return false;
        }
        if self.in_stock && !p.in_stock() {
            return false;
        }
        if self.on_sale && !p.on_sale() {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Rating,
    Newest,
    BestSelling,
}

impl SortMode {
    /// Unknown or missing tokens mean relevance.
    pub fn parse(token: Option<&str>) -> Self {
        match token.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("price_asc") => SortMode::PriceAsc,
            Some("price_desc") => SortMode::PriceDesc,
            Some("rating") => SortMode::Rating,
            Some("newest") => SortMode::Newest,
            Some("best_selling") => SortMode::BestSelling,
            _ => SortMode::Relevance,
        }
    }

    /// Row ordering for non-relevance sorts; ties break on id.
    pub fn compare(self, a: &Product, b: &Product) -> Ordering {
        let primary = match self {
            SortMode::Relevance => Ordering::Equal,
            SortMode::PriceAsc => a.price.total_cmp(&b.price),
            SortMode::PriceDesc => b.price.total_cmp(&a.price),
            SortMode::Rating => b.rating.total_cmp(&a.rating).then(b.review_count.cmp(&a.review_count)),
            SortMode::Newest => b.created_at.cmp(&a.created_at),
            SortMode::BestSelling => b.sales_count.cmp(&a.sales_count),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::models::{Category, Vendor};

    fn product(id: &str, price: f64) -> Product {
        serde_json::from_value(serde_json::json!({
            "id": id, "vendor_id": "v1", "category_id": "child", "name": id, "price": price
        }))
        .unwrap()
    }

    fn catalog() -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        catalog.upsert_category(Category {
            id: "root".into(),
            name: "Home".into(),
            slug: "home".into(),
            parent_id: None,
            is_active: true,
        });
        catalog.upsert_category(Category {
            id: "child".into(),
            name: "Lighting".into(),
            slug: "lighting".into(),
            parent_id: Some("root".into()),
            is_active: true,
        });
        catalog.upsert_vendor(Vendor { id: "v1".into(), name: "Lumen".into(), slug: "lumen".into(), is_active: true });
        catalog
    }

    #[test]
    fn sort_tokens_fall_back_to_relevance() {
        assert_eq!(SortMode::parse(Some("price_desc")), SortMode::PriceDesc);
        assert_eq!(SortMode::parse(Some("cheapest")), SortMode::Relevance);
        assert_eq!(SortMode::parse(None), SortMode::Relevance);
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let neg = AppliedFilters { min_price: Some(-1.0), ..Default::default() };
        assert!(neg.validate().is_err());
        let inverted = AppliedFilters { min_price: Some(50.0), max_price: Some(10.0), ..Default::default() };
        assert!(inverted.validate().is_err());
        let rating = AppliedFilters { min_rating: Some(7.0), ..Default::default() };
        assert!(rating.validate().is_err());
        assert!(AppliedFilters::default().validate().is_ok());
    }

    #[tokio::test]
    async fn category_filter_covers_descendants() {
        let catalog = catalog();
        let filters = AppliedFilters { category: Some("home".into()), ..Default::default() };
        let pred = FilterPredicate::resolve(&filters, &catalog).await.unwrap().unwrap();
        assert!(pred.matches(&product("a", 10.0)));
        assert!(!pred.is_trivial());
    }

    #[tokio::test]
    async fn unknown_slug_resolves_to_empty() {
        let catalog = catalog();
        let filters = AppliedFilters { category: Some("nope".into()), ..Default::default() };
        assert!(FilterPredicate::resolve(&filters, &catalog).await.unwrap().is_none());
        let filters = AppliedFilters { vendor: Some("ghost".into()), ..Default::default() };
        assert!(FilterPredicate::resolve(&filters, &catalog).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vendor_accepts_slug_or_id() {
        let catalog = catalog();
        for vendor in ["lumen", "v1", "ghost, v1"] {
            let filters = AppliedFilters { vendor: Some(vendor.into()), ..Default::default() };
            let pred = FilterPredicate::resolve(&filters, &catalog).await.unwrap().unwrap();
            assert!(pred.matches(&product("a", 10.0)), "{vendor}");
        }
    }

    #[tokio::test]
    async fn price_rating_stock_and_sale() {
        let catalog = catalog();
        let filters = AppliedFilters {
            min_price: Some(20.0),
            max_price: Some(100.0),
            in_stock: true,
            on_sale: true,
            ..Default::default()
        };
        let pred = FilterPredicate::resolve(&filters, &catalog).await.unwrap().unwrap();
        let mut p = product("a", 50.0);
        assert!(!pred.matches(&p));
        p.quantity = 3;
        p.compare_at_price = Some(80.0);
        assert!(pred.matches(&p));
        p.price = 150.0;
        assert!(!pred.matches(&p));
    }
}
