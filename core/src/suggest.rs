//! Did-you-mean corrections against a small vocabulary of catalog words.

use lazy_static::lazy_static;
use levenshtein_automata::{Distance, LevenshteinAutomatonBuilder};
use std::collections::BTreeSet;

use crate::tokenizer::{fold_text, MIN_TOKEN_CHARS};

#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub text: String,
    /// Mean per-word similarity in `[0, 1]`.
    pub confidence: f64,
}

lazy_static! {
    // Transpositions cost one, so the automata measure optimal string
    // alignment distance up to their bound.
    static ref ONE_EDIT: LevenshteinAutomatonBuilder = LevenshteinAutomatonBuilder::new(1, true);
    static ref TWO_EDITS: LevenshteinAutomatonBuilder = LevenshteinAutomatonBuilder::new(2, true);
}

/// Automaton builder for an edit budget, clamped to `1..=2`.
fn automaton(max_edits: usize) -> &'static LevenshteinAutomatonBuilder {
    if max_edits <= 1 {
        &ONE_EDIT
    } else {
        &TWO_EDITS
    }
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Length-normalized edit similarity with a small bonus for a shared prefix.
pub fn similarity(word: &str, candidate: &str, distance: usize) -> f64 {
    let longest = word.chars().count().max(candidate.chars().count());
    if longest == 0 {
        return 1.0;
    }
    let edit = 1.0 - distance.min(longest) as f64 / longest as f64;
    let prefix = common_prefix(word, candidate) as f64 / longest as f64;
    0.8 * edit + 0.2 * prefix
}

fn max_edits(word: &str) -> usize {
    if word.chars().count() <= 4 {
        1
    } else {
        2
    }
}

/// Split catalog text into vocabulary words.
pub fn vocabulary<'a>(texts: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    texts
        .into_iter()
        .flat_map(|t| fold_text(t).split(' ').map(str::to_string).collect::<Vec<_>>())
        .filter(|w| w.chars().count() >= MIN_TOKEN_CHARS)
        .collect()
}

/// Replace each query word with its closest vocabulary word. `None` when
/// nothing changes or the mean similarity stays under `min_confidence`.
pub fn correct(query: &str, vocabulary: &BTreeSet<String>, min_confidence: f64) -> Option<Correction> {
    let folded = fold_text(query);
    let words: Vec<&str> = folded.split(' ').filter(|w| !w.is_empty()).collect();
    if words.is_empty() || vocabulary.is_empty() {
        return None;
    }

    let mut out = Vec::with_capacity(words.len());
    let mut total = 0.0;
    for word in &words {
        if vocabulary.contains(*word) {
            out.push(word.to_string());
            total += 1.0;
            continue;
        }
        let limit = max_edits(word);
        let len = word.chars().count();
        let dfa = automaton(limit).build_dfa(word);
        let mut best: Option<(&str, f64)> = None;
        for candidate in vocabulary {
            if candidate.chars().count().abs_diff(len) > limit {
                continue;
            }
            let Distance::Exact(distance) = dfa.eval(candidate) else {
                continue;
            };
            let score = similarity(word, candidate, usize::from(distance));
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((candidate, score));
            }
        }
        match best {
            Some((candidate, score)) => {
                out.push(candidate.to_string());
                total += score;
            }
            None => out.push(word.to_string()),
        }
    }

    let text = out.join(" ");
    let confidence = total / words.len() as f64;
    if text == folded || confidence < min_confidence {
        return None;
    }
    Some(Correction { text, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distance(a: &str, b: &str, max_edits: usize) -> Option<u8> {
        match automaton(max_edits).build_dfa(a).eval(b) {
            Distance::Exact(d) => Some(d),
            Distance::AtLeast(_) => None,
        }
    }

    #[test]
    fn distance_counts_transpositions_once() {
        assert_eq!(distance("laptp", "laptop", 2), Some(1));
        assert_eq!(distance("lpatop", "laptop", 2), Some(1));
        assert_eq!(distance("same", "same", 1), Some(0));
        assert_eq!(distance("café", "cafe", 1), Some(1));
        assert_eq!(distance("", "abc", 2), None);
        assert_eq!(distance("lamp", "desk", 2), None);
    }

    #[test]
    fn similarity_rewards_shared_prefix() {
        assert!(similarity("laptp", "laptop", 1) > similarity("laptp", "xaptop", 2));
        assert_eq!(similarity("same", "same", 0), 1.0);
    }

    #[test]
    fn corrects_single_typo() {
        let vocab = vocabulary(["Gaming Laptop", "Laptop Stand", "Lighting"]);
        let c = correct("laptp", &vocab, 0.7).unwrap();
        assert_eq!(c.text, "laptop");
        assert!(c.confidence >= 0.7);
    }

    #[test]
    fn corrects_only_the_misspelled_word() {
        let vocab = vocabulary(["Gaming Laptop"]);
        assert_eq!(correct("gaming laptp", &vocab, 0.7).unwrap().text, "gaming laptop");
    }

    #[test]
    fn no_suggestion_when_unchanged_or_far() {
        let vocab = vocabulary(["Laptop"]);
        assert!(correct("laptop", &vocab, 0.7).is_none());
        assert!(correct("zebra", &vocab, 0.7).is_none());
        assert!(correct("", &vocab, 0.7).is_none());
    }
}
