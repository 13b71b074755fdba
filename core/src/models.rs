use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Active,
    Draft,
    Inactive,
    Archived,
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn yes() -> bool {
    true
}

/// A row of the authoritative catalog. The search core only reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub vendor_id: String,
    #[serde(default)]
    pub category_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub price: f64,
    #[serde(default)]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub review_count: u32,
    #[serde(default)]
    pub sales_count: u64,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub status: ProductStatus,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(with = "time::serde::rfc3339", default = "now_utc")]
    pub created_at: OffsetDateTime,
}

impl Product {
    pub fn is_active(&self) -> bool {
        self.status == ProductStatus::Active
    }

    pub fn in_stock(&self) -> bool {
        self.quantity > 0
    }

    pub fn on_sale(&self) -> bool {
        self.compare_at_price.is_some_and(|c| c > self.price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "yes")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default = "yes")]
    pub is_active: bool,
}
