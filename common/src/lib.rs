#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod error;
pub mod storage {
    pub mod artifacts;
    pub mod db;
    pub mod store;
    pub mod types;
}
pub mod utils {
    pub mod config;
    pub mod embedding;
}
pub mod vector;
