use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use crate::config::RankingConfig;
use crate::models::Product;
use crate::query::Query;
use crate::tokenizer::tokenize_spans;

pub type DocId = u32;

pub const FIELD_COUNT: usize = 4;

/// Searchable fields of a [`Document`], in index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Name = 0,
    Description = 1,
    Tags = 2,
    Category = 3,
}

impl Field {
    pub const ALL: [Field; FIELD_COUNT] =
        [Field::Name, Field::Description, Field::Tags, Field::Category];

    pub fn idx(self) -> usize {
        self as usize
    }

    fn weight(self, ranking: &RankingConfig) -> f64 {
        match self {
            Field::Name => ranking.weights.name,
            Field::Description => ranking.weights.description,
            Field::Tags => ranking.weights.tags,
            Field::Category => ranking.weights.category,
        }
    }
}

/// The indexed projection of one active product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_name: String,
}

impl Document {
    pub fn from_product(product: &Product, category_name: Option<&str>) -> Self {
        let description = format!("{} {}", product.description, product.short_description)
            .trim()
            .to_string();
        Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            description,
            tags: product.tags.clone(),
            category_name: category_name.unwrap_or_default().to_string(),
        }
    }

    pub fn field_text(&self, field: Field) -> Cow<'_, str> {
        match field {
            Field::Name => Cow::Borrowed(&self.name),
            Field::Description => Cow::Borrowed(&self.description),
            Field::Tags => Cow::Owned(self.tags.join(", ")),
            Field::Category => Cow::Borrowed(&self.category_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Posting {
    pub doc_id: DocId,
    pub field: Field,
    /// Token positions within the field, ascending.
    pub positions: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocAddress {
    pub segment: u32,
    pub doc_id: DocId,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    doc: Document,
    lens: [u32; FIELD_COUNT],
}

/// Append-only run of documents. Deletes leave a tombstone until the
/// segments are merged.
#[derive(Debug, Default, Clone)]
struct Segment {
    docs: Vec<Option<StoredDoc>>,
    // postings sorted by (doc_id, field)
    postings: BTreeMap<String, Vec<Posting>>,
    deleted: usize,
}

impl Segment {
    fn add(&mut self, doc: Document) -> DocId {
        let doc_id = self.docs.len() as DocId;
        let mut lens = [0u32; FIELD_COUNT];
        for field in Field::ALL {
            let text = doc.field_text(field);
            let tokens = tokenize_spans(&text);
            lens[field.idx()] = tokens.len() as u32;
            let mut by_term: BTreeMap<String, Vec<u32>> = BTreeMap::new();
            for t in tokens {
                by_term.entry(t.term).or_default().push(t.position);
            }
            for (term, positions) in by_term {
                self.postings.entry(term).or_default().push(Posting { doc_id, field, positions });
            }
        }
        self.docs.push(Some(StoredDoc { doc, lens }));
        doc_id
    }

    fn live(&self, doc_id: DocId) -> Option<&StoredDoc> {
        self.docs.get(doc_id as usize).and_then(Option::as_ref)
    }
}

/// Result of matching a query: ranked addresses and the index terms that
/// matched, for highlighting.
#[derive(Debug, Default)]
pub struct MatchSet {
    /// `(address, rank)` with the most relevant (most negative) first.
    pub hits: Vec<(DocAddress, f64)>,
    pub matched_terms: HashSet<String>,
}

type FieldFreqs = [u32; FIELD_COUNT];

pub struct InvertedIndex {
    segments: Vec<Segment>,
    live: HashMap<String, DocAddress>,
    field_totals: [u64; FIELD_COUNT],
    segment_max_docs: usize,
}

impl InvertedIndex {
    pub fn new(segment_max_docs: usize) -> Self {
        Self {
            segments: Vec::new(),
            live: HashMap::new(),
            field_totals: [0; FIELD_COUNT],
            segment_max_docs: segment_max_docs.max(1),
        }
    }

    /// Build a compact single-segment index. Later duplicates of a product id win.
    pub fn from_documents(docs: impl IntoIterator<Item = Document>, segment_max_docs: usize) -> Self {
        let unique: BTreeMap<String, Document> =
            docs.into_iter().map(|d| (d.product_id.clone(), d)).collect();
        let mut index = Self::new(segment_max_docs);
        let mut segment = Segment::default();
        for (id, doc) in unique {
            let doc_id = segment.add(doc);
            index.account(segment.live(doc_id), 1);
            index.live.insert(id, DocAddress { segment: 0, doc_id });
        }
        if !segment.docs.is_empty() {
            index.segments.push(segment);
        }
        index
    }

    fn account(&mut self, stored: Option<&StoredDoc>, sign: i64) {
        if let Some(stored) = stored {
            for (total, len) in self.field_totals.iter_mut().zip(stored.lens) {
                *total = total.saturating_add_signed(sign * len as i64);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Tombstoned documents still occupying segment space.
    pub fn deleted_count(&self) -> usize {
        self.segments.iter().map(|s| s.deleted).sum()
    }

    /// Insert or replace the document for `doc.product_id`.
    pub fn insert(&mut self, doc: Document) {
        let product_id = doc.product_id.clone();
        self.delete(&product_id);
        let needs_segment = self
            .segments
            .last()
            .map_or(true, |s| s.docs.len() >= self.segment_max_docs);
        if needs_segment {
            self.segments.push(Segment::default());
        }
        let segment = self.segments.len() - 1;
        let doc_id = self.segments[segment].add(doc);
        let stored = self.segments[segment].live(doc_id).cloned();
        self.account(stored.as_ref(), 1);
        self.live.insert(product_id, DocAddress { segment: segment as u32, doc_id });
    }

    pub fn delete(&mut self, product_id: &str) -> bool {
        let Some(addr) = self.live.remove(product_id) else {
            return false;
        };
        let stored = self
            .segments
            .get_mut(addr.segment as usize)
            .and_then(|s| {
                let taken = s.docs.get_mut(addr.doc_id as usize).and_then(Option::take);
                if taken.is_some() {
                    s.deleted += 1;
                }
                taken
            });
        self.account(stored.as_ref(), -1);
        true
    }

    pub fn get(&self, product_id: &str) -> Option<&Document> {
        self.live.get(product_id).and_then(|a| self.document_at(*a))
    }

    pub fn document_at(&self, addr: DocAddress) -> Option<&Document> {
        self.segments
            .get(addr.segment as usize)
            .and_then(|s| s.live(addr.doc_id))
            .map(|s| &s.doc)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.segments
            .iter()
            .flat_map(|s| s.docs.iter().flatten().map(|d| &d.doc))
    }

    /// Merge every segment into one, dropping tombstones. Postings are
    /// remapped, not re-derived, so matching is unchanged.
    pub fn merged(&self) -> InvertedIndex {
        let mut merged = Segment::default();
        let mut remap: Vec<Vec<Option<DocId>>> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let mut map = Vec::with_capacity(segment.docs.len());
            for slot in &segment.docs {
                match slot {
                    Some(stored) => {
                        map.push(Some(merged.docs.len() as DocId));
                        merged.docs.push(Some(stored.clone()));
                    }
                    None => map.push(None),
                }
            }
            remap.push(map);
        }
        for (si, segment) in self.segments.iter().enumerate() {
            for (term, list) in &segment.postings {
                let live: Vec<Posting> = list
                    .iter()
                    .filter_map(|p| {
                        remap[si][p.doc_id as usize].map(|doc_id| Posting {
                            doc_id,
                            field: p.field,
                            positions: p.positions.clone(),
                        })
                    })
                    .collect();
                if !live.is_empty() {
                    merged.postings.entry(term.clone()).or_default().extend(live);
                }
            }
        }

        let mut live = HashMap::with_capacity(self.live.len());
        for (doc_id, slot) in merged.docs.iter().enumerate() {
            if let Some(stored) = slot {
                live.insert(
                    stored.doc.product_id.clone(),
                    DocAddress { segment: 0, doc_id: doc_id as DocId },
                );
            }
        }
        let segments = if merged.docs.is_empty() { Vec::new() } else { vec![merged] };
        InvertedIndex {
            segments,
            live,
            field_totals: self.field_totals,
            segment_max_docs: self.segment_max_docs,
        }
    }

    /// Score every matching document with BM25 over the weighted fields.
    ///
    /// Each query leaf is scored like a single phrase: its frequency in a
    /// field is the number of hits of any term it expands to, and its
    /// document frequency is the number of live documents it hits.
    /// Ranks are negated scores; `min_rank` keeps ranks at or below it.
    pub fn search(&self, query: &Query, ranking: &RankingConfig, min_rank: Option<f64>) -> MatchSet {
        let mut result = MatchSet::default();
        if self.is_empty() {
            return result;
        }
        let n = self.len() as f64;
        let mut avg = [0f64; FIELD_COUNT];
        for (a, total) in avg.iter_mut().zip(self.field_totals) {
            *a = total as f64 / n;
        }

        let mut scores: HashMap<DocAddress, f64> = HashMap::new();
        for leaf in query.leaves() {
            let freqs = self.leaf_frequencies(leaf, &mut result.matched_terms);
            if freqs.is_empty() {
                continue;
            }
            let df = freqs.len() as f64;
            let mut idf = ((n - df + 0.5) / (df + 0.5)).ln();
            if idf <= 0.0 {
                idf = 1e-6;
            }
            for (addr, tf) in freqs {
                let Some(stored) = self.segments[addr.segment as usize].live(addr.doc_id) else {
                    continue;
                };
                let mut leaf_score = 0.0;
                for field in Field::ALL {
                    let f = field.idx();
                    if tf[f] == 0 {
                        continue;
                    }
                    let tf_f = tf[f] as f64;
                    let len_ratio = if avg[f] > 0.0 { stored.lens[f] as f64 / avg[f] } else { 1.0 };
                    let norm = ranking.k1 * (1.0 - ranking.b + ranking.b * len_ratio);
                    leaf_score += field.weight(ranking) * (tf_f * (ranking.k1 + 1.0)) / (tf_f + norm);
                }
                *scores.entry(addr).or_insert(0.0) += idf * leaf_score;
            }
        }

        let mut hits: Vec<(DocAddress, f64)> = scores
            .into_iter()
            .map(|(addr, score)| (addr, -score))
            .filter(|(_, rank)| min_rank.map_or(true, |m| *rank <= m))
            .collect();
        hits.sort_by(|a, b| {
            a.1.total_cmp(&b.1).then_with(|| self.product_id_at(a.0).cmp(self.product_id_at(b.0)))
        });
        result.hits = hits;
        result
    }

    fn product_id_at(&self, addr: DocAddress) -> &str {
        self.document_at(addr).map_or("", |d| d.product_id.as_str())
    }

    fn leaf_frequencies(&self, leaf: &Query, matched: &mut HashSet<String>) -> HashMap<DocAddress, FieldFreqs> {
        let mut out: HashMap<DocAddress, FieldFreqs> = HashMap::new();
        match leaf {
            Query::Term(term) => {
                for (si, segment) in self.segments.iter().enumerate() {
                    if let Some(list) = segment.postings.get(term) {
                        if count_postings(si, segment, list, &mut out) {
                            matched.insert(term.clone());
                        }
                    }
                }
            }
            Query::Prefix(prefix) => {
                for (si, segment) in self.segments.iter().enumerate() {
                    let range = segment
                        .postings
                        .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                        .take_while(|(term, _)| term.starts_with(prefix.as_str()));
                    for (term, list) in range {
                        if count_postings(si, segment, list, &mut out) {
                            matched.insert(term.clone());
                        }
                    }
                }
            }
            Query::Phrase(terms) => {
                for (si, segment) in self.segments.iter().enumerate() {
                    if phrase_postings(si, segment, terms, &mut out) {
                        matched.extend(terms.iter().cloned());
                    }
                }
            }
            Query::Or(children) => {
                for child in children {
                    for (addr, tf) in self.leaf_frequencies(child, matched) {
                        let entry = out.entry(addr).or_insert([0; FIELD_COUNT]);
                        for (e, t) in entry.iter_mut().zip(tf) {
                            *e += t;
                        }
                    }
                }
            }
        }
        out
    }
}

fn count_postings(
    si: usize,
    segment: &Segment,
    list: &[Posting],
    out: &mut HashMap<DocAddress, FieldFreqs>,
) -> bool {
    let mut any = false;
    for p in list {
        if segment.live(p.doc_id).is_none() {
            continue;
        }
        any = true;
        let addr = DocAddress { segment: si as u32, doc_id: p.doc_id };
        out.entry(addr).or_insert([0; FIELD_COUNT])[p.field.idx()] += p.positions.len() as u32;
    }
    any
}

fn find_posting(list: &[Posting], doc_id: DocId, field: Field) -> Option<&Posting> {
    list.binary_search_by(|p| match p.doc_id.cmp(&doc_id) {
        Ordering::Equal => p.field.cmp(&field),
        other => other,
    })
    .ok()
    .map(|i| &list[i])
}

fn phrase_postings(
    si: usize,
    segment: &Segment,
    terms: &[String],
    out: &mut HashMap<DocAddress, FieldFreqs>,
) -> bool {
    let Some((first, rest)) = terms.split_first() else {
        return false;
    };
    let Some(head) = segment.postings.get(first) else {
        return false;
    };
    let mut tails = Vec::with_capacity(rest.len());
    for term in rest {
        match segment.postings.get(term) {
            Some(list) => tails.push(list),
            None => return false,
        }
    }

    let mut any = false;
    for p in head {
        if segment.live(p.doc_id).is_none() {
            continue;
        }
        let others: Option<Vec<&Posting>> = tails
            .iter()
            .map(|list| find_posting(list, p.doc_id, p.field))
            .collect();
        let Some(others) = others else {
            continue;
        };
        let hits = p
            .positions
            .iter()
            .filter(|&&pos| {
                others
                    .iter()
                    .enumerate()
                    .all(|(k, o)| o.positions.binary_search(&(pos + k as u32 + 1)).is_ok())
            })
            .count() as u32;
        if hits > 0 {
            any = true;
            let addr = DocAddress { segment: si as u32, doc_id: p.doc_id };
            out.entry(addr).or_insert([0; FIELD_COUNT])[p.field.idx()] += hits;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, name: &str, description: &str) -> Document {
        Document {
            product_id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            tags: vec![],
            category_name: String::new(),
        }
    }

    fn ids(index: &InvertedIndex, q: &Query) -> Vec<String> {
        index
            .search(q, &RankingConfig::default(), None)
            .hits
            .iter()
            .map(|(a, _)| index.document_at(*a).unwrap().product_id.clone())
            .collect()
    }

    #[test]
    fn replaces_and_deletes() {
        let mut index = InvertedIndex::new(2);
        index.insert(doc("a", "red lamp", ""));
        index.insert(doc("a", "blue lamp", ""));
        assert_eq!(index.len(), 1);
        assert_eq!(index.deleted_count(), 1);
        assert!(ids(&index, &Query::Term("red".into())).is_empty());
        assert_eq!(ids(&index, &Query::Term("blue".into())), vec!["a"]);
        assert!(index.delete("a"));
        assert!(!index.delete("a"));
        assert!(index.is_empty());
    }

    #[test]
    fn name_hits_outrank_description_hits() {
        let mut index = InvertedIndex::new(16);
        index.insert(doc("desc", "desk", "a lamp for reading"));
        index.insert(doc("name", "reading lamp", "bright"));
        index.insert(doc("other", "chair", "wooden"));
        assert_eq!(ids(&index, &Query::Term("lamp".into())), vec!["name", "desc"]);
    }

    #[test]
    fn prefix_expands_terms() {
        let mut index = InvertedIndex::new(16);
        index.insert(doc("a", "Bluetooth speaker", ""));
        index.insert(doc("b", "Blue mug", ""));
        let m = index.search(&Query::Prefix("blue".into()), &RankingConfig::default(), None);
        assert_eq!(m.hits.len(), 2);
        assert!(m.matched_terms.contains("bluetooth"));
        assert!(m.matched_terms.contains("blue"));
    }

    #[test]
    fn phrase_requires_adjacency() {
        let mut index = InvertedIndex::new(16);
        index.insert(doc("a", "noise cancelling headphones", ""));
        index.insert(doc("b", "cancelling the noise", ""));
        let q = Query::Phrase(vec!["nois".into(), "cancel".into()]);
        assert_eq!(ids(&index, &q), vec!["a"]);
    }

    #[test]
    fn merge_keeps_results_and_drops_tombstones() {
        let mut index = InvertedIndex::new(1);
        for (id, name) in [("a", "oak desk"), ("b", "oak shelf"), ("c", "pine desk")] {
            index.insert(doc(id, name, "solid wood"));
        }
        index.delete("b");
        let q = Query::Or(vec![Query::Term("oak".into()), Query::Term("desk".into())]);
        let before = index.search(&q, &RankingConfig::default(), None);
        let merged = index.merged();
        let after = merged.search(&q, &RankingConfig::default(), None);
        assert_eq!(index.segment_count(), 3);
        assert_eq!(merged.segment_count(), 1);
        assert_eq!(merged.deleted_count(), 0);
        let ranks = |m: &MatchSet| m.hits.iter().map(|h| h.1).collect::<Vec<_>>();
        assert_eq!(ranks(&before), ranks(&after));
        assert_eq!(ids(&merged, &q), vec!["a", "c"]);
    }

    #[test]
    fn min_rank_cuts_weak_hits() {
        let mut index = InvertedIndex::new(16);
        index.insert(doc("strong", "lamp", ""));
        index.insert(doc("weak", "desk", "lamp"));
        let all = index.search(&Query::Term("lamp".into()), &RankingConfig::default(), None);
        let cutoff = all.hits[0].1;
        let strict = index.search(&Query::Term("lamp".into()), &RankingConfig::default(), Some(cutoff));
        assert_eq!(strict.hits.len(), 1);
    }
}
