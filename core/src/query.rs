//! User query sanitization and the internal query language.
//!
//! Raw input is cleaned by [`sanitize`], then [`parse`] turns it into a
//! [`Query`] tree. Terms are OR-ed together; ranking decides what comes
//! first. The tree is rendered only at the index boundary, never spliced
//! together from user strings.

use std::fmt;

use crate::config::QueryConfig;
use crate::tokenizer::{fold, normalize_prefix, tokenize, tokenize_spans, word_spans};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Exact match on one normalized term.
    Term(String),
    /// Any term starting with this normalized prefix.
    Prefix(String),
    /// Adjacent terms, in order, within one field.
    Phrase(Vec<String>),
    Or(Vec<Query>),
}

impl Query {
    /// The non-`Or` nodes of the tree, depth first.
    pub fn leaves(&self) -> Vec<&Query> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Query>) {
        match self {
            Query::Or(children) => children.iter().for_each(|c| c.collect_leaves(out)),
            leaf => out.push(leaf),
        }
    }
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Term(t) => write!(f, "{}", quote(t)),
            Query::Prefix(p) => write!(f, "{}*", quote(p)),
            Query::Phrase(terms) => write!(f, "{}", quote(&terms.join(" "))),
            Query::Or(children) => {
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " OR ")?;
                    }
                    write!(f, "{c}")?;
                }
                Ok(())
            }
        }
    }
}

fn is_allowed(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '"' | '*' | '+' | '-') || c.is_whitespace()
}

/// Truncate to `max_len` bytes, turn whitespace runs into one space, drop
/// control characters and anything outside letters, digits, `"*+-`.
pub fn sanitize(raw: &str, max_len: usize) -> String {
    let mut cut = raw.len().min(max_len);
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut);
    let mut pending_space = false;
    for c in raw[..cut].chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if c.is_control() || !is_allowed(c) {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}

/// A sanitized query and its parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    /// Sanitized text, as recorded in analytics.
    pub text: String,
    pub query: Query,
    /// Plain tokens of the query, used by the substring engine.
    pub tokens: Vec<String>,
}

impl ParsedQuery {
    /// Sanitize and parse. `None` means nothing searchable survived.
    pub fn parse(raw: &str, config: &QueryConfig) -> Option<Self> {
        let text = sanitize(raw, config.max_length);
        let query = parse(&text, config.implicit_prefix)?;
        let plain: String = text.chars().filter(|c| !matches!(c, '"' | '*')).collect();
        let tokens = tokenize(&plain);
        Some(Self { text, query, tokens })
    }

    /// Parse treating every word as a prefix, for autocomplete.
    pub fn parse_prefix(raw: &str, config: &QueryConfig) -> Option<Self> {
        let text = sanitize(raw, config.max_length);
        let query = parse(&text, true)?;
        let tokens = tokenize(&text);
        Some(Self { text, query, tokens })
    }
}

/// Parse sanitized text into a query tree.
pub fn parse(text: &str, implicit_prefix: bool) -> Option<Query> {
    let mut leaves: Vec<Query> = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c == '"' {
            let start = idx + 1;
            let mut end = text.len();
            for (j, d) in chars.by_ref() {
                if d == '"' {
                    end = j;
                    break;
                }
            }
            push_unique(&mut leaves, phrase_leaf(&text[start..end]));
            continue;
        }
        let mut end = text.len();
        while let Some(&(j, d)) = chars.peek() {
            if d.is_whitespace() || d == '"' {
                end = j;
                break;
            }
            chars.next();
        }
        push_unique(&mut leaves, word_leaf(&text[idx..end], implicit_prefix));
    }

    match leaves.len() {
        0 => None,
        1 => leaves.pop(),
        _ => Some(Query::Or(leaves)),
    }
}

fn push_unique(leaves: &mut Vec<Query>, leaf: Option<Query>) {
    if let Some(leaf) = leaf {
        if !leaves.contains(&leaf) {
            leaves.push(leaf);
        }
    }
}

fn phrase_leaf(inner: &str) -> Option<Query> {
    let mut terms = tokenize(inner);
    match terms.len() {
        0 => None,
        1 => terms.pop().map(Query::Term),
        _ => Some(Query::Phrase(terms)),
    }
}

fn word_leaf(word: &str, implicit_prefix: bool) -> Option<Query> {
    let word = word.trim_start_matches(['+', '-']);
    let explicit_prefix = word.ends_with('*');
    let body: String = word.chars().filter(|c| *c != '*').collect();

    let spans = word_spans(&body);
    if spans.len() > 1 {
        // "wi-fi" style compounds only match where their parts are adjacent.
        let terms: Vec<String> = tokenize_spans(&body).into_iter().map(|t| t.term).collect();
        return match terms.len() {
            0 => None,
            1 => terms.into_iter().next().map(Query::Term),
            _ => Some(Query::Phrase(terms)),
        };
    }

    if explicit_prefix {
        return normalize_prefix(&body).map(Query::Prefix);
    }
    if fold(&body).chars().count() < 2 {
        return None;
    }
    let mut terms = tokenize(&body);
    let term = terms.pop()?;
    if implicit_prefix {
        Some(Query::Prefix(term))
    } else {
        Some(Query::Term(term))
    }
}
