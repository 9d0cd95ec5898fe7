//! BM25 index for lexical search

use std::collections::HashMap;

use uuid::Uuid;

/// BM25 parameter: term frequency saturation
const K1: f32 = 1.2;

/// BM25 parameter: length normalization factor
const B: f32 = 0.75;

/// Inverted index over a set of documents keyed by uuid
pub struct Bm25Index {
    /// term -> [(doc, term frequency)]
    inverted: HashMap<String, Vec<(Uuid, f32)>>,
    doc_lengths: HashMap<Uuid, f32>,
    avg_doc_length: f32,
    num_docs: usize,
}

impl Bm25Index {
    /// Build the index from `(uuid, text)` pairs
    pub fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = (Uuid, &'a str)>,
    {
        let mut inverted: HashMap<String, Vec<(Uuid, f32)>> = HashMap::new();
        let mut doc_lengths: HashMap<Uuid, f32> = HashMap::new();
        let mut total_length = 0.0;

        for (id, text) in documents {
            let tokens = tokenize(text);
            let doc_length = tokens.len() as f32;

            doc_lengths.insert(id, doc_length);
            total_length += doc_length;

            let mut term_freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *term_freqs.entry(token).or_insert(0) += 1;
            }

            for (term, freq) in term_freqs {
                inverted.entry(term).or_default().push((id, freq as f32));
            }
        }

        let num_docs = doc_lengths.len();
        let avg_doc_length = if num_docs > 0 {
            total_length / num_docs as f32
        } else {
            0.0
        };

        Self {
            inverted,
            doc_lengths,
            avg_doc_length,
            num_docs,
        }
    }

    /// Search with BM25 scoring, best first. Only documents sharing at least
    /// one query term are returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(Uuid, f32)> {
        let mut query_tokens = tokenize(query);
        query_tokens.sort();
        query_tokens.dedup();

        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        for token in &query_tokens {
            if let Some(postings) = self.inverted.get(token) {
                let idf = self.idf(postings.len());
                for (doc_id, tf) in postings {
                    let doc_length = self.doc_lengths.get(doc_id).copied().unwrap_or(1.0);
                    *scores.entry(*doc_id).or_insert(0.0) += self.bm25_score(*tf, doc_length, idf);
                }
            }
        }

        let mut results: Vec<_> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results.truncate(limit);
        results
    }

    pub fn len(&self) -> usize {
        self.num_docs
    }

    pub fn is_empty(&self) -> bool {
        self.num_docs == 0
    }

    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.num_docs as f32;
        let df = doc_freq as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn bm25_score(&self, tf: f32, doc_length: f32, idf: f32) -> f32 {
        let avg = if self.avg_doc_length > 0.0 {
            self.avg_doc_length
        } else {
            1.0
        };
        let numerator = tf * (K1 + 1.0);
        let denominator = tf + K1 * (1.0 - B + B * doc_length / avg);
        idf * numerator / denominator
    }
}

/// Lower-case, split on non-alphanumerics, drop tokens shorter than 3 chars
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.chars().count() > 2)
        .map(String::from)
        .collect()
}
