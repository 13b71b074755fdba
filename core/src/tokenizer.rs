use lazy_static::lazy_static;
use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
}

/// Shortest stem kept in the index.
pub const MIN_TOKEN_CHARS: usize = 2;

/// A normalized term plus where it came from in the source text.
///
/// `start..end` is the byte span of the original word, so snippets can wrap
/// the text the user actually wrote rather than the stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub position: u32,
    pub start: usize,
    pub end: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || is_combining_mark(c)
}

/// Byte spans of maximal runs of letters and digits.
pub fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, c) in text.char_indices() {
        match (is_word_char(c), start) {
            (true, None) => start = Some(idx),
            (false, Some(s)) => {
                spans.push((s, idx));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Lowercase a word and fold accented letters to their base form.
pub fn fold(word: &str) -> String {
    word.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Fold a whole string, keeping word boundaries as single spaces.
pub fn fold_text(text: &str) -> String {
    word_spans(text)
        .into_iter()
        .map(|(s, e)| fold(&text[s..e]))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn stem(folded: &str) -> String {
    STEMMER.stem(folded).into_owned()
}

/// Tokenize text into positioned terms: unicode fold, lowercase, split on
/// anything that is not a letter or digit, stem, drop stems shorter than two
/// characters. Index time and query time both go through here.
pub fn tokenize_spans(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut position = 0u32;
    for (start, end) in word_spans(text) {
        let folded = fold(&text[start..end]);
        if folded.is_empty() {
            continue;
        }
        let term = stem(&folded);
        if term.chars().count() < MIN_TOKEN_CHARS {
            continue;
        }
        tokens.push(Token { term, position, start, end });
        position += 1;
    }
    tokens
}

/// Tokenize text into its ordered sequence of terms.
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_spans(text).into_iter().map(|t| t.term).collect()
}

/// Normalize the head of a prefix query. Unlike [`tokenize`] a single
/// character survives, since `l*` is a legitimate autocomplete request.
pub fn normalize_prefix(word: &str) -> Option<String> {
    let folded = fold(word);
    if folded.is_empty() {
        return None;
    }
    let stemmed = stem(&folded);
    if stemmed.is_empty() {
        Some(folded)
    } else {
        Some(stemmed)
    }
}
