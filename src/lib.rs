//! Receipt scanning pipeline: OCR text in, structured evidence-backed
//! fields out, stored idempotently.
//!
//! ```text
//! image path
//!  │
//!  ├─ digest      SHA-256 of the image bytes (the deduplication key)
//!  ├─ OCR         remote line-OCR service → {text, confidence} lines
//!  ├─ normalize   trimmed non-empty lines, the only citation space
//!  ├─ rules       heuristic candidates per field (merchant/date/total/currency)
//!  ├─ model       grounded extraction request → validated JSON response
//!  ├─ merge       null/missing fields filled from top rule candidates
//!  └─ store       content-addressed upsert (insert or update in place)
//! ```
//!
//! The pipeline is synchronous and fail-fast: apart from an OCR payload of
//! unexpected shape (which degrades to an empty line sequence), every error
//! aborts the receipt and nothing is persisted. The caller owns retries;
//! re-running the same image is safe because the store key is
//! content-derived.

mod db;
mod error;
mod files;
mod llm;
mod ocr;
mod pipeline;
mod rules;
mod types;

pub use db::Db;
pub use error::ScanError;
pub use files::sha256_file;
pub use llm::LlmClient;
pub use ocr::{OcrApiShape, OcrEngine, RemoteOcrEngine};
pub use pipeline::process_receipt;
pub use rules::{build_rule_candidates, normalize_lines};
pub use types::{
    Candidate, ExtractionResult, OcrLine, ReceiptRecord, ReceiptSummary, RuleCandidateSet,
    StoredReceipt, UpsertOutcome, UpsertResult,
};
