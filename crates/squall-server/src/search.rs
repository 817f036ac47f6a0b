//! Full-text search: per-node inverted index and cluster-merge ranking.
//!
//! Maps opted into search (`fullTextSearch` config) index their configured
//! fields on every write. A local search scores candidates with smoothed
//! TF-IDF; cluster-wide results from several nodes are merged rank-wise with
//! Reciprocal-Rank-Fusion, which needs no score calibration across nodes.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use squall_core::protocol::{SearchHit, SearchQuery};
use squall_core::Value;

/// Minimum token length kept by the tokenizer.
const MIN_TOKEN_LEN: usize = 2;

/// Lowercased alphanumeric tokens of `text`, in order, duplicates kept.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= MIN_TOKEN_LEN)
        .map(ToString::to_string)
        .collect()
}

/// Pulls the indexable text out of one configured field value.
fn field_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => {
            for item in items {
                field_text(item, out);
            }
        }
        _ => {}
    }
}

#[derive(Default)]
struct InvertedIndex {
    /// term -> key -> term frequency.
    postings: HashMap<String, HashMap<String, u32>>,
    /// key -> distinct terms, for cheap removal on update/delete.
    doc_terms: HashMap<String, Vec<String>>,
}

impl InvertedIndex {
    fn remove_doc(&mut self, key: &str) {
        if let Some(terms) = self.doc_terms.remove(key) {
            for term in terms {
                if let Some(posting) = self.postings.get_mut(&term) {
                    posting.remove(key);
                    if posting.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
    }

    fn index_doc(&mut self, key: &str, tokens: &[String]) {
        self.remove_doc(key);
        if tokens.is_empty() {
            return;
        }
        let mut freqs: HashMap<&str, u32> = HashMap::new();
        for token in tokens {
            *freqs.entry(token.as_str()).or_insert(0) += 1;
        }
        let mut distinct = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.postings
                .entry(term.to_string())
                .or_default()
                .insert(key.to_string(), tf);
            distinct.push(term.to_string());
        }
        self.doc_terms.insert(key.to_string(), distinct);
    }

    fn doc_count(&self) -> usize {
        self.doc_terms.len()
    }

    /// Smoothed TF-IDF: `sum_t (1 + ln tf) * ln(1 + N/df)`.
    fn score(&self, key: &str, terms: &[String]) -> Option<(f64, Vec<String>)> {
        #[allow(clippy::cast_precision_loss)]
        let n = self.doc_count() as f64;
        let mut score = 0.0;
        let mut matched = Vec::new();
        for term in terms {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let Some(&tf) = posting.get(key) else {
                continue;
            };
            #[allow(clippy::cast_precision_loss)]
            let df = posting.len() as f64;
            score += (1.0 + f64::from(tf).ln()) * (1.0 + n / df).ln();
            matched.push(term.clone());
        }
        (!matched.is_empty()).then(|| {
            matched.sort();
            matched.dedup();
            (score, matched)
        })
    }
}

/// Per-node search service.
pub struct SearchService {
    configs: HashMap<String, Vec<String>>,
    indexes: DashMap<String, InvertedIndex>,
    rrf_k: f64,
}

impl SearchService {
    /// Creates a service from the `fullTextSearch` config section.
    #[must_use]
    pub fn new(configs: HashMap<String, Vec<String>>, rrf_k: f64) -> Self {
        Self { configs, indexes: DashMap::new(), rrf_k }
    }

    /// Whether writes to `map_name` are indexed.
    #[must_use]
    pub fn is_indexed(&self, map_name: &str) -> bool {
        self.configs.contains_key(map_name)
    }

    /// The configured RRF rank constant.
    #[must_use]
    pub fn rrf_k(&self) -> f64 {
        self.rrf_k
    }

    /// Re-indexes one document after a write; `None` removes it.
    pub fn on_write(&self, map_name: &str, key: &str, live: Option<&Value>) {
        let Some(fields) = self.configs.get(map_name) else {
            return;
        };
        let mut index = self.indexes.entry(map_name.to_string()).or_default();
        match live {
            None => index.remove_doc(key),
            Some(value) => {
                let mut text = String::new();
                for field in fields {
                    if let Some(field_value) = value.field(field) {
                        field_text(field_value, &mut text);
                    }
                }
                index.index_doc(key, &tokenize(&text));
            }
        }
    }

    /// Ranked local search. Returns `(hits, total_matches)`; `hits` respects
    /// the query limit, `total_matches` does not.
    #[must_use]
    pub fn search(&self, map_name: &str, query: &SearchQuery) -> (Vec<SearchHit>, u64) {
        let terms = tokenize(&query.text);
        let Some(index) = self.indexes.get(map_name) else {
            return (Vec::new(), 0);
        };

        let mut candidates: HashSet<&String> = HashSet::new();
        for term in &terms {
            if let Some(posting) = index.postings.get(term) {
                candidates.extend(posting.keys());
            }
        }

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|key| {
                index.score(key, &terms).map(|(score, matched)| SearchHit {
                    key: key.clone(),
                    score,
                    matched_terms: Some(matched),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        let total = hits.len() as u64;
        if let Some(limit) = query.limit {
            hits.truncate(limit as usize);
        }
        (hits, total)
    }

    /// Scores a single document against a query, for live search updates.
    #[must_use]
    pub fn score_doc(
        &self,
        map_name: &str,
        query: &SearchQuery,
        key: &str,
    ) -> Option<(f64, Vec<String>)> {
        let terms = tokenize(&query.text);
        self.indexes.get(map_name)?.score(key, &terms)
    }

    /// Merges per-node ranked lists with Reciprocal-Rank-Fusion.
    ///
    /// `rrf(key) = sum_over_nodes 1 / (k + rank)`, rank starting at 1 in
    /// each node's list. Rank-based fusion sidesteps cross-node score
    /// calibration entirely.
    #[must_use]
    pub fn rrf_merge(&self, lists: &[Vec<SearchHit>], limit: Option<u32>) -> Vec<SearchHit> {
        let mut fused: HashMap<String, (f64, Vec<String>)> = HashMap::new();
        for list in lists {
            for (rank, hit) in list.iter().enumerate() {
                #[allow(clippy::cast_precision_loss)]
                let contribution = 1.0 / (self.rrf_k + (rank + 1) as f64);
                let entry = fused.entry(hit.key.clone()).or_insert((0.0, Vec::new()));
                entry.0 += contribution;
                if let Some(terms) = &hit.matched_terms {
                    for term in terms {
                        if !entry.1.contains(term) {
                            entry.1.push(term.clone());
                        }
                    }
                }
            }
        }
        let mut merged: Vec<SearchHit> = fused
            .into_iter()
            .map(|(key, (score, mut terms))| {
                terms.sort();
                SearchHit {
                    key,
                    score,
                    matched_terms: (!terms.is_empty()).then_some(terms),
                }
            })
            .collect();
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        if let Some(limit) = limit {
            merged.truncate(limit as usize);
        }
        merged
    }
}
