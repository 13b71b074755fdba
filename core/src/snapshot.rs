use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{Category, Product, Vendor};

/// A point-in-time dump of the catalog.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub vendors: Vec<Vendor>,
    #[serde(default)]
    pub products: Vec<Product>,
}

/// One line of a JSONL snapshot.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CatalogRecord {
    Category(Category),
    Vendor(Vendor),
    Product(Product),
}

impl CatalogSnapshot {
    fn push(&mut self, record: CatalogRecord) {
        match record {
            CatalogRecord::Category(c) => self.categories.push(c),
            CatalogRecord::Vendor(v) => self.vendors.push(v),
            CatalogRecord::Product(p) => self.products.push(p),
        }
    }

    fn extend(&mut self, other: CatalogSnapshot) {
        self.categories.extend(other.categories);
        self.vendors.extend(other.vendors);
        self.products.extend(other.products);
    }
}

/// Load a snapshot from a `.json` / `.jsonl` file or a directory of them.
pub fn load_snapshot(path: &Path) -> Result<CatalogSnapshot> {
    let mut files: Vec<PathBuf> = Vec::new();
    if path.is_dir() {
        for entry in WalkDir::new(path).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if path.is_file() {
        files.push(path.to_path_buf());
    } else {
        anyhow::bail!("catalog snapshot not found: {}", path.display());
    }

    let mut snapshot = CatalogSnapshot::default();
    for file in files {
        if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            load_jsonl(&file, &mut snapshot)?;
        } else {
            load_json(&file, &mut snapshot)?;
        }
    }
    tracing::info!(
        products = snapshot.products.len(),
        categories = snapshot.categories.len(),
        vendors = snapshot.vendors.len(),
        "catalog snapshot loaded"
    );
    Ok(snapshot)
}

fn load_jsonl(file: &Path, snapshot: &mut CatalogSnapshot) -> Result<()> {
    let f = File::open(file).with_context(|| format!("open {}", file.display()))?;
    let reader = BufReader::new(f);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CatalogRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), lineno + 1))?;
        snapshot.push(record);
    }
    Ok(())
}

fn load_json(file: &Path, snapshot: &mut CatalogSnapshot) -> Result<()> {
    let f = File::open(file).with_context(|| format!("open {}", file.display()))?;
    let reader = BufReader::new(f);
    let part: CatalogSnapshot =
        serde_json::from_reader(reader).with_context(|| format!("parse {}", file.display()))?;
    snapshot.extend(part);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_json_and_jsonl_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"categories":[{"id":"c1","name":"Lighting","slug":"lighting"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.jsonl"),
            concat!(
                r#"{"type":"vendor","id":"v1","name":"Lumen Co","slug":"lumen"}"#,
                "\n\n",
                r#"{"type":"product","id":"p1","vendor_id":"v1","category_id":"c1","name":"Desk Lamp","price":20.0}"#,
                "\n"
            ),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let snapshot = load_snapshot(dir.path()).unwrap();
        assert_eq!(snapshot.categories.len(), 1);
        assert_eq!(snapshot.vendors.len(), 1);
        assert_eq!(snapshot.products.len(), 1);
        assert!(snapshot.products[0].is_active());
        assert!(snapshot.categories[0].is_active);
    }

    #[test]
    fn missing_path_is_an_error() {
        assert!(load_snapshot(Path::new("/definitely/not/here.json")).is_err());
    }
}
