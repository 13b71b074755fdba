//! Read access to the authoritative catalog.
//!
//! The search core never writes the catalog. [`CatalogReader`] is the whole
//! surface it depends on; [`MemoryCatalog`] is the in-process implementation
//! used by the server and the tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::CatalogError;
use crate::models::{Category, Product, Vendor};
use crate::snapshot::CatalogSnapshot;
use crate::sync::CatalogChange;

#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Batched lookup; unknown ids are skipped, order is unspecified.
    async fn products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>, CatalogError>;

    /// Active products ordered by id, for scans in bounded batches.
    async fn active_products(&self, offset: usize, limit: usize) -> Result<Vec<Product>, CatalogError>;

    /// Every product pointing at `category_id`, active or not.
    async fn products_in_category(&self, category_id: &str) -> Result<Vec<Product>, CatalogError>;

    /// Active products by sales, then rating.
    async fn top_products(&self, limit: usize) -> Result<Vec<Product>, CatalogError>;

    async fn category(&self, id: &str) -> Result<Option<Category>, CatalogError>;

    async fn category_by_slug(&self, slug: &str) -> Result<Option<Category>, CatalogError>;

    /// `category_id` and all of its descendants.
    async fn category_subtree(&self, category_id: &str) -> Result<Vec<String>, CatalogError>;

    /// Active categories ordered by name.
    async fn categories(&self) -> Result<Vec<Category>, CatalogError>;

    async fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>, CatalogError>;

    /// Active vendors ordered by name.
    async fn vendors(&self) -> Result<Vec<Vendor>, CatalogError>;
}

#[derive(Default)]
struct CatalogData {
    products: BTreeMap<String, Product>,
    categories: BTreeMap<String, Category>,
    vendors: BTreeMap<String, Vendor>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let catalog = Self::new();
        {
            let mut data = catalog.data.write();
            data.categories = snapshot.categories.into_iter().map(|c| (c.id.clone(), c)).collect();
            data.vendors = snapshot.vendors.into_iter().map(|v| (v.id.clone(), v)).collect();
            data.products = snapshot.products.into_iter().map(|p| (p.id.clone(), p)).collect();
        }
        catalog
    }

    pub fn upsert_product(&self, product: Product) -> Option<Product> {
        self.data.write().products.insert(product.id.clone(), product)
    }

    pub fn remove_product(&self, id: &str) -> Option<Product> {
        self.data.write().products.remove(id)
    }

    pub fn upsert_category(&self, category: Category) {
        self.data.write().categories.insert(category.id.clone(), category);
    }

    pub fn upsert_vendor(&self, vendor: Vendor) {
        self.data.write().vendors.insert(vendor.id.clone(), vendor);
    }

    pub fn rename_category(&self, id: &str, name: &str) -> bool {
        match self.data.write().categories.get_mut(id) {
            Some(category) => {
                category.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Apply a catalog write, as the external write path would before
    /// notifying the sync engine.
    pub fn apply(&self, change: &CatalogChange) {
        match change {
            CatalogChange::Inserted { snapshot } | CatalogChange::Updated { snapshot } => {
                self.upsert_product(snapshot.clone());
            }
            CatalogChange::Deleted { product_id } => {
                self.remove_product(product_id);
            }
            CatalogChange::CategoryRenamed { category_id, new_name } => {
                self.rename_category(category_id, new_name);
            }
        }
    }

    pub fn product_count(&self) -> usize {
        self.data.read().products.len()
    }
}

fn by_sales_then_rating(a: &Product, b: &Product) -> std::cmp::Ordering {
    b.sales_count
        .cmp(&a.sales_count)
        .then_with(|| b.rating.total_cmp(&a.rating))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl CatalogReader for MemoryCatalog {
    async fn products_by_ids(&self, ids: &[String]) -> Result<Vec<Product>, CatalogError> {
        let data = self.data.read();
        Ok(ids.iter().filter_map(|id| data.products.get(id).cloned()).collect())
    }

    async fn active_products(&self, offset: usize, limit: usize) -> Result<Vec<Product>, CatalogError> {
        let data = self.data.read();
        Ok(data
            .products
            .values()
            .filter(|p| p.is_active())
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn products_in_category(&self, category_id: &str) -> Result<Vec<Product>, CatalogError> {
        let data = self.data.read();
        Ok(data
            .products
            .values()
            .filter(|p| p.category_id.as_deref() == Some(category_id))
            .cloned()
            .collect())
    }

    async fn top_products(&self, limit: usize) -> Result<Vec<Product>, CatalogError> {
        let data = self.data.read();
        let mut products: Vec<Product> = data.products.values().filter(|p| p.is_active()).cloned().collect();
        products.sort_by(by_sales_then_rating);
        products.truncate(limit);
        Ok(products)
    }

    async fn category(&self, id: &str) -> Result<Option<Category>, CatalogError> {
        Ok(self.data.read().categories.get(id).cloned())
    }

    async fn category_by_slug(&self, slug: &str) -> Result<Option<Category>, CatalogError> {
        let data = self.data.read();
        Ok(data.categories.values().find(|c| c.slug == slug).cloned())
    }

    async fn category_subtree(&self, category_id: &str) -> Result<Vec<String>, CatalogError> {
        let data = self.data.read();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for c in data.categories.values() {
            if let Some(parent) = c.parent_id.as_deref() {
                children.entry(parent).or_default().push(c.id.as_str());
            }
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([category_id]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id.to_string());
            if let Some(kids) = children.get(id) {
                queue.extend(kids.iter().copied());
            }
        }
        Ok(out)
    }

    async fn categories(&self) -> Result<Vec<Category>, CatalogError> {
        let data = self.data.read();
        let mut out: Vec<Category> = data.categories.values().filter(|c| c.is_active).cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn vendor_by_slug(&self, slug: &str) -> Result<Option<Vendor>, CatalogError> {
        let data = self.data.read();
        Ok(data.vendors.values().find(|v| v.slug == slug).cloned())
    }

    async fn vendors(&self) -> Result<Vec<Vendor>, CatalogError> {
        let data = self.data.read();
        let mut out: Vec<Vendor> = data.vendors.values().filter(|v| v.is_active).cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(id: &str, parent: Option<&str>) -> Category {
        Category {
            id: id.to_string(),
            name: id.to_uppercase(),
            slug: format!("{id}-slug"),
            parent_id: parent.map(str::to_string),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn subtree_walks_descendants_once() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_category(category("root", None));
        catalog.upsert_category(category("child", Some("root")));
        catalog.upsert_category(category("grandchild", Some("child")));
        catalog.upsert_category(category("other", None));

        let mut ids = catalog.category_subtree("root").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["child", "grandchild", "root"]);
        assert_eq!(catalog.category_subtree("grandchild").await.unwrap(), vec!["grandchild"]);
    }

    #[tokio::test]
    async fn apply_mirrors_catalog_writes() {
        let catalog = MemoryCatalog::new();
        let lamp: Product = serde_json::from_value(serde_json::json!({
            "id": "p1", "vendor_id": "v1", "name": "Desk Lamp", "price": 10.0
        }))
        .unwrap();
        catalog.apply(&CatalogChange::Inserted { snapshot: lamp });
        assert_eq!(catalog.product_count(), 1);
        catalog.apply(&CatalogChange::Deleted { product_id: "p1".into() });
        assert_eq!(catalog.product_count(), 0);
        assert!(catalog.products_by_ids(&["p1".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookups_by_slug() {
        let catalog = MemoryCatalog::new();
        catalog.upsert_category(category("lighting", None));
        assert!(catalog.category_by_slug("lighting-slug").await.unwrap().is_some());
        assert!(catalog.category_by_slug("missing").await.unwrap().is_none());
        assert!(catalog.rename_category("lighting", "Lamps"));
        assert_eq!(catalog.category("lighting").await.unwrap().unwrap().name, "Lamps");
    }
}
