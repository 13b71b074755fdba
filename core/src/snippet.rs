use crate::config::HighlightConfig;
use crate::tokenizer::{tokenize_spans, Token};

/// Cut a window of at most `max_tokens` tokens out of `text`, choosing the
/// window with the most matching tokens (earliest on ties), and wrap each
/// match in the configured markers. Elided text on either side becomes the
/// ellipsis.
pub fn snippet<F>(text: &str, max_tokens: usize, style: &HighlightConfig, is_match: F) -> String
where
    F: Fn(&Token) -> bool,
{
    let tokens = tokenize_spans(text);
    if tokens.is_empty() {
        return text.to_string();
    }
    let flags: Vec<bool> = tokens.iter().map(&is_match).collect();
    let width = max_tokens.max(1).min(tokens.len());

    let mut best_start = 0;
    let mut best_count: usize = flags[..width].iter().filter(|m| **m).count();
    let mut count = best_count;
    for start in 1..=(tokens.len() - width) {
        if flags[start - 1] {
            count -= 1;
        }
        if flags[start + width - 1] {
            count += 1;
        }
        if count > best_count {
            best_count = count;
            best_start = start;
        }
    }
    // center the matches inside the chosen window
    let window = best_start..best_start + width;
    if let (Some(first), Some(last)) = (
        window.clone().find(|&i| flags[i]),
        window.rev().find(|&i| flags[i]),
    ) {
        let slack = width - (last - first + 1);
        best_start = first.saturating_sub(slack / 2).min(tokens.len() - width);
    }
    let end = best_start + width;

    let mut out = String::with_capacity(text.len().min(512));
    let mut cursor = if best_start == 0 {
        0
    } else {
        out.push_str(&style.ellipsis);
        tokens[best_start].start
    };
    for (tok, matched) in tokens[best_start..end].iter().zip(&flags[best_start..end]) {
        out.push_str(&text[cursor..tok.start]);
        if *matched {
            out.push_str(&style.open);
            out.push_str(&text[tok.start..tok.end]);
            out.push_str(&style.close);
        } else {
            out.push_str(&text[tok.start..tok.end]);
        }
        cursor = tok.end;
    }
    if end == tokens.len() {
        out.push_str(&text[cursor..]);
    } else {
        out.push_str(&style.ellipsis);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn terms(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wraps_matched_words_with_original_case() {
        let set = terms(&["bluetooth"]);
        let s = snippet("Wireless Bluetooth Headphones", 32, &HighlightConfig::default(), |t| {
            set.contains(&t.term)
        });
        assert_eq!(s, "Wireless <mark>Bluetooth</mark> Headphones");
    }

    #[test]
    fn elides_around_best_window() {
        let set = terms(&["lamp"]);
        let text = "one two three four lamp six seven eight";
        let s = snippet(text, 3, &HighlightConfig::default(), |t| set.contains(&t.term));
        assert_eq!(s, "...four <mark>lamp</mark> six...");
    }

    #[test]
    fn no_match_shows_leading_window() {
        let s = snippet("alpha beta gamma", 2, &HighlightConfig::default(), |_| false);
        assert_eq!(s, "alpha beta...");
    }

    #[test]
    fn custom_markers() {
        let style = HighlightConfig {
            open: "[".into(),
            close: "]".into(),
            ellipsis: "…".into(),
            ..HighlightConfig::default()
        };
        let set = terms(&["desk"]);
        assert_eq!(snippet("Oak desk.", 8, &style, |t| set.contains(&t.term)), "Oak [desk].");
    }
}
