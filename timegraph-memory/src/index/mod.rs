//! In-process index structures shared by the store backends
//!
//! - [`bm25`]: inverted index with BM25 scoring for lexical retrieval
//! - [`vector`]: cosine similarity and exact top-k selection

pub mod bm25;
pub mod vector;

pub use bm25::Bm25Index;
pub use vector::{cosine_similarity, top_k_by_similarity};
