//! End-to-end processing of one receipt image.
//!
//! Synchronous and single-receipt: OCR, rule candidates, model extraction
//! and fallback merge run to completion before anything is returned. Only an
//! OCR shape mismatch is absorbed (as an empty line sequence); any model
//! failure aborts the receipt with nothing persisted.

use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::ScanError;
use crate::files::sha256_file;
use crate::llm::LlmClient;
use crate::ocr::OcrEngine;
use crate::rules::{build_rule_candidates, normalize_lines};
use crate::types::{Candidate, ReceiptRecord, RuleCandidateSet};

fn now_iso_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn top_value(candidates: &[Candidate]) -> Value {
    candidates
        .first()
        .map(|c| Value::String(c.value.clone()))
        .unwrap_or(Value::Null)
}

/// Missing for text fields: absent key, JSON null, or empty string.
fn is_missing_text(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Fill null/missing extracted fields from the top-ranked rule candidates.
///
/// Applies to `extracted` only; evidence is never back-filled, so a
/// fallback value legitimately carries null evidence. For the numeric
/// `total` only an actual null counts as missing.
pub fn apply_fallbacks(extracted: &mut Map<String, Value>, candidates: &RuleCandidateSet) {
    if is_missing_text(extracted.get("merchant")) {
        extracted.insert("merchant".to_string(), top_value(&candidates.merchant));
    }
    if is_missing_text(extracted.get("date")) {
        extracted.insert("date".to_string(), top_value(&candidates.date));
    }
    if is_missing_text(extracted.get("currency")) {
        extracted.insert("currency".to_string(), top_value(&candidates.currency));
    }
    if extracted.get("total").map_or(true, Value::is_null) {
        extracted.insert("total".to_string(), top_value(&candidates.total));
    }
}

/// Process one receipt image into a flat record ready for upsert.
///
/// Fails fast: a missing source path, an unreachable model service, or a
/// malformed/invalid model response each abort the run before anything is
/// written anywhere.
pub fn process_receipt(
    engine: &dyn OcrEngine,
    llm: &LlmClient,
    path: &Path,
) -> Result<ReceiptRecord, ScanError> {
    if !path.exists() {
        return Err(ScanError::SourceNotFound { path: path.to_path_buf() });
    }

    let started_at = now_iso_utc();
    let source_sha = sha256_file(path)?;

    let ocr_lines = engine.extract_lines(path)?;
    let lines = normalize_lines(&ocr_lines);
    let ocr_text = lines.join("\n");

    let ocr_json = json!({
        "lines": ocr_lines
            .iter()
            .map(|l| json!({"text": l.text, "confidence": l.confidence.unwrap_or(0.0)}))
            .collect::<Vec<_>>(),
        "text": ocr_text,
    });

    let rule_candidates = build_rule_candidates(&lines);

    let mut extraction = llm.extract(&lines, &rule_candidates)?;
    apply_fallbacks(&mut extraction.extracted, &rule_candidates);

    let du_json = extraction.to_json();
    let field = |name: &str| extraction.extracted.get(name).cloned().unwrap_or(Value::Null);

    let meta_json = json!({
        "source_path": path.to_string_lossy(),
        "source_sha": source_sha,
        "started_at": started_at,
        "processed_at": now_iso_utc(),
        "ocr_line_count": ocr_lines.len(),
        "rule_candidates": serde_json::to_value(&rule_candidates)?,
    });

    info!(sha = %source_sha, lines = ocr_lines.len(), "receipt processed");
    Ok(ReceiptRecord {
        source_sha,
        source_path: Some(path.to_string_lossy().into_owned()),
        merchant: field("merchant"),
        receipt_date: field("date"),
        total_amount: field("total"),
        currency: field("currency"),
        ocr_text,
        ocr_json,
        du_json,
        meta_json,
    })
}
