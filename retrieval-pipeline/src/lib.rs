#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod reranking;
pub mod retriever;

pub use reranking::{RerankScore, Reranker, RerankerPool};
pub use retriever::{
    RagRetriever, RetrievalQuery, RetrievalResult, RetrievedChunk, RetrievedSource,
};
