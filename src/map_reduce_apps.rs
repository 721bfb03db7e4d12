use crate::common::{kv, KeyValue, MapReduceApp};
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static WORDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}+").expect("invalid regex"));

/// Maximal runs of letter characters.
pub fn tokenize(contents: &str) -> impl Iterator<Item = &str> {
    WORDS_REGEX.find_iter(contents).map(|w| w.as_str())
}

pub struct WordCount {}

impl MapReduceApp for WordCount {
    fn map(&self, _filename: &str, contents: &str) -> Vec<KeyValue> {
        tokenize(contents).map(|w| kv(w, "1")).collect()
    }

    fn reduce(&self, key: &str, values: &[String]) -> String {
        let total: u64 = values
            .iter()
            .map(|v| match v.parse::<u64>() {
                Ok(n) => n,
                Err(err) => {
                    warn!(key, value = %v, "cannot convert count: {}", err);
                    0
                }
            })
            .sum();
        total.to_string()
    }
}

pub struct InvertedIndex {}

impl MapReduceApp for InvertedIndex {
    fn map(&self, filename: &str, contents: &str) -> Vec<KeyValue> {
        tokenize(contents).map(|w| kv(w, filename)).collect()
    }

    fn reduce(&self, _key: &str, values: &[String]) -> String {
        let mut files: Vec<&str> = values.iter().map(String::as_str).collect();
        files.sort_unstable();
        files.dedup();
        format!("{} {}", files.len(), files.join(","))
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a of the key bytes, masked to a non-negative value.
pub fn partition_hash(key: &str) -> u32 {
    let hash = key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash & 0x7fff_ffff
}

pub fn bucket_index(key: &str, n_reducers: u32) -> u32 {
    partition_hash(key) % n_reducers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(vs: &[&str]) -> Vec<String> {
        vs.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn tokenizes_letter_runs_only() {
        let words: Vec<_> = tokenize("the cat's 2nd-best  hat\nÉté").collect();
        assert_eq!(words, vec!["the", "cat", "s", "nd", "best", "hat", "Été"]);
    }

    #[test]
    fn word_count_emits_one_per_occurrence() {
        let pairs = WordCount {}.map("a.txt", "the cat the");
        assert_eq!(pairs, vec![kv("the", "1"), kv("cat", "1"), kv("the", "1")]);
    }

    #[test]
    fn word_count_sums_and_zeroes_garbage() {
        let app = WordCount {};
        assert_eq!(app.reduce("the", &values(&["1", "1", "3"])), "5");
        assert_eq!(app.reduce("the", &values(&["1", "x", "1"])), "2");
        assert_eq!(app.reduce("the", &[]), "0");
    }

    #[test]
    fn inverted_index_emits_file_name() {
        let pairs = InvertedIndex {}.map("b.txt", "dog dog");
        assert_eq!(pairs, vec![kv("dog", "b.txt"), kv("dog", "b.txt")]);
    }

    #[test]
    fn inverted_index_dedups_and_sorts() {
        let app = InvertedIndex {};
        let out = app.reduce("the", &values(&["b.txt", "a.txt", "b.txt", "a.txt"]));
        assert_eq!(out, "2 a.txt,b.txt");
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Reference FNV-1a 32-bit values, masked to 31 bits.
        assert_eq!(partition_hash(""), 0x811c_9dc5 & 0x7fff_ffff);
        assert_eq!(partition_hash("a"), 0xe40c_292c & 0x7fff_ffff);
        assert_eq!(partition_hash("foobar"), 0xbf9c_f968 & 0x7fff_ffff);
    }

    #[test]
    fn bucket_index_is_deterministic_and_in_range() {
        for key in ["the", "cat", "sat", "dog", "Été", ""] {
            let first = bucket_index(key, 7);
            assert!(first < 7);
            assert_eq!(first, bucket_index(key, 7));
        }
        assert_eq!(bucket_index("anything", 1), 0);
    }
}
