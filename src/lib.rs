//! # Sibyl
//!
//! Retrieval-augmented reasoning over an ad-hoc knowledge base.
//!
//! Documents and URLs are chunked, embedded, and stored in a SQLite-backed
//! vector index. Questions are answered by a bounded reasoning loop that
//! retrieves passages by similarity, streams each reasoning step to the
//! caller, and finishes with an answer citing the passages it used.
//!
//! ```text
//! text / url -> chunk -> embed -> VectorIndex
//! question   -> ReasoningAgent -> retrieve -> ... -> cited Answer
//! ```
//!
//! | Module       | Responsibility                                      |
//! |--------------|-----------------------------------------------------|
//! | `chunk`      | window+overlap splitting with boundary preference   |
//! | `embedding`  | provider trait, OpenAI-compatible client, codecs    |
//! | `index`      | SQLite vector collection: upsert/replace/search     |
//! | `knowledge`  | ingest pipeline and retrieval facade                |
//! | `generation` | chat provider trait, client, directive parsing      |
//! | `agent`      | the reasoning loop and citation extraction          |
//! | `sources`    | text/URL ingestion boundary                         |

pub mod agent;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod knowledge;
pub mod models;
pub mod sources;

pub use error::{Error, Result};
