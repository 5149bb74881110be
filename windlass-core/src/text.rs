//! Text helpers shared by the priority scorer and compression fallbacks.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)|\n+").expect("sentence pattern is valid"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}_']+").expect("word pattern is valid"));

/// Split text into trimmed, non-empty sentences. Terminal punctuation is kept.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for m in SENTENCE_END.find_iter(text) {
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = m.end();
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

/// Lowercased words of `text`
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    WORD.find_iter(text)
        .map(|m| m.as_str().trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
}

/// Lowercased words of at least `min_chars` characters
pub fn content_words(text: &str, min_chars: usize) -> impl Iterator<Item = String> + '_ {
    words(text).filter(move |w| w.chars().count() >= min_chars)
}

/// Words ranked by frequency, most frequent first. Ties keep first-seen order.
pub fn ranked_terms<'a, I>(texts: I, min_chars: usize) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0;

    for text in texts {
        for word in content_words(text, min_chars) {
            let entry = counts.entry(word).or_insert_with(|| {
                order += 1;
                (0, order)
            });
            entry.0 += 1;
        }
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first_seen))| (word, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(w, c, _)| (w, c)).collect()
}
