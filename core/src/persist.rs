use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::IndexError;
use crate::index::Document;

/// Bump when tokenization or document layout changes; a mismatch on open
/// makes startup reconciliation rebuild the index from the catalog.
pub const SCHEMA_VERSION: u32 = 1;

const META_KEY: &[u8] = b"meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFile {
    pub num_docs: u32,
    pub created_at: String,
    pub version: u32,
}

pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    fn db(&self) -> PathBuf {
        self.root.join("documents.sled")
    }
}

/// Durable copy of every indexed document, keyed by product id. Postings
/// are derived from it in memory when the index is opened.
pub struct DocumentStore {
    db: sled::Db,
    documents: sled::Tree,
    meta: sled::Tree,
}

impl DocumentStore {
    pub fn open(paths: &IndexPaths) -> Result<Self, IndexError> {
        std::fs::create_dir_all(&paths.root)
            .map_err(|e| IndexError::Unavailable(format!("{}: {e}", paths.root.display())))?;
        let db = sled::open(paths.db())?;
        Self::from_db(db)
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> Result<Self, IndexError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, IndexError> {
        let documents = db.open_tree("documents")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, documents, meta })
    }

    pub fn load_documents(&self) -> Result<Vec<Document>, IndexError> {
        let mut docs = Vec::with_capacity(self.documents.len());
        for entry in self.documents.iter() {
            let (_, bytes) = entry?;
            docs.push(bincode::deserialize(&bytes)?);
        }
        Ok(docs)
    }

    pub fn put(&self, doc: &Document) -> Result<(), IndexError> {
        let bytes = bincode::serialize(doc)?;
        self.documents.insert(doc.product_id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete(&self, product_id: &str) -> Result<(), IndexError> {
        self.documents.remove(product_id.as_bytes())?;
        Ok(())
    }

    /// Replace the whole document set in one batch and stamp the schema version.
    pub fn replace_all(&self, docs: &[Document]) -> Result<(), IndexError> {
        let mut batch = sled::Batch::default();
        for key in self.documents.iter().keys() {
            batch.remove(key?);
        }
        for doc in docs {
            batch.insert(doc.product_id.as_bytes(), bincode::serialize(doc)?);
        }
        self.documents.apply_batch(batch)?;
        self.save_meta(docs.len())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn save_meta(&self, num_docs: usize) -> Result<(), IndexError> {
        let meta = MetaFile {
            num_docs: num_docs as u32,
            created_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            version: SCHEMA_VERSION,
        };
        self.meta.insert(META_KEY, serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    pub fn load_meta(&self) -> Result<Option<MetaFile>, IndexError> {
        match self.meta.get(META_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    pub fn flush(&self) -> Result<(), IndexError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> Document {
        Document {
            product_id: id.to_string(),
            name: format!("product {id}"),
            description: String::new(),
            tags: vec!["t".into()],
            category_name: "Lighting".into(),
        }
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        {
            let store = DocumentStore::open(&paths).unwrap();
            store.put(&doc("a")).unwrap();
            store.put(&doc("b")).unwrap();
            store.delete("a").unwrap();
            store.flush().unwrap();
        }
        let store = DocumentStore::open(&paths).unwrap();
        let docs = store.load_documents().unwrap();
        assert_eq!(docs, vec![doc("b")]);
        assert!(store.load_meta().unwrap().is_none());
    }

    #[test]
    fn replace_all_swaps_contents_and_stamps_version() {
        let store = DocumentStore::temporary().unwrap();
        store.put(&doc("old")).unwrap();
        store.replace_all(&[doc("x"), doc("y")]).unwrap();
        let ids: Vec<String> = store.load_documents().unwrap().into_iter().map(|d| d.product_id).collect();
        assert_eq!(ids, vec!["x", "y"]);
        let meta = store.load_meta().unwrap().unwrap();
        assert_eq!(meta.version, SCHEMA_VERSION);
        assert_eq!(meta.num_docs, 2);
    }
}
