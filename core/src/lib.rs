pub mod analytics;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod models;
pub mod persist;
pub mod planner;
pub mod query;
pub mod snapshot;
pub mod snippet;
pub mod store;
pub mod suggest;
pub mod sync;
pub mod tokenizer;

pub use index::{DocId, Document, Field, InvertedIndex, Posting};
pub use store::{Index, IndexStore};
