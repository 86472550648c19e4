//! OCR engine access.
//!
//! The engine is an external line-OCR HTTP service: image bytes go out, a
//! JSON payload of recognized lines comes back. Two wire generations are
//! supported and the adapter is chosen once at construction; a payload that
//! matches neither expectation degrades to an empty line sequence rather
//! than failing the receipt.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ScanError;
use crate::types::OcrLine;

fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Seam between the pipeline and the OCR collaborator.
pub trait OcrEngine {
    fn extract_lines(&self, image_path: &Path) -> Result<Vec<OcrLine>, ScanError>;
}

/// Wire format generation of the OCR service, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrApiShape {
    /// Parallel `rec_texts` / `rec_scores` arrays.
    RecArrays,
    /// `lines: [{text, confidence}]` objects.
    LineObjects,
}

impl OcrApiShape {
    fn from_env() -> Self {
        match std::env::var("OCR_API_SHAPE").unwrap_or_default().trim() {
            "line_objects" => OcrApiShape::LineObjects,
            _ => OcrApiShape::RecArrays,
        }
    }
}

/// Uniform accessors over one recognized page, independent of the wire
/// format version.
trait RecognizedPage {
    fn recognized_texts(&self) -> Option<Vec<String>>;
    fn recognized_scores(&self) -> Option<Vec<f64>>;
}

struct RecArraysPage<'a>(&'a Value);

impl RecognizedPage for RecArraysPage<'_> {
    fn recognized_texts(&self) -> Option<Vec<String>> {
        let texts = self.0.get("rec_texts")?.as_array()?;
        texts
            .iter()
            .map(|t| t.as_str().map(str::to_string))
            .collect()
    }

    fn recognized_scores(&self) -> Option<Vec<f64>> {
        let scores = self.0.get("rec_scores")?.as_array()?;
        scores.iter().map(Value::as_f64).collect()
    }
}

struct LineObjectsPage<'a>(&'a Value);

impl RecognizedPage for LineObjectsPage<'_> {
    fn recognized_texts(&self) -> Option<Vec<String>> {
        let lines = self.0.get("lines")?.as_array()?;
        lines
            .iter()
            .map(|l| l.get("text").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    fn recognized_scores(&self) -> Option<Vec<f64>> {
        let lines = self.0.get("lines")?.as_array()?;
        lines
            .iter()
            .map(|l| l.get("confidence").and_then(Value::as_f64))
            .collect()
    }
}

fn collect_lines(page: &dyn RecognizedPage) -> Vec<OcrLine> {
    let Some(texts) = page.recognized_texts() else {
        return Vec::new();
    };
    let scores = page
        .recognized_scores()
        .filter(|s| s.len() == texts.len());

    let mut lines = Vec::with_capacity(texts.len());
    for (i, text) in texts.iter().enumerate() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        lines.push(OcrLine {
            text: trimmed.to_string(),
            confidence: scores.as_ref().map(|s| s[i]),
        });
    }
    lines
}

/// Parse the service payload into lines. The payload is either a list with
/// one page per image or a single page object; anything else is treated as a
/// shape mismatch and yields no lines.
fn parse_lines(payload: &Value, shape: OcrApiShape) -> Vec<OcrLine> {
    let page = match payload {
        Value::Array(pages) => match pages.first() {
            Some(p) => p,
            None => return Vec::new(),
        },
        other => other,
    };
    match shape {
        OcrApiShape::RecArrays => collect_lines(&RecArraysPage(page)),
        OcrApiShape::LineObjects => collect_lines(&LineObjectsPage(page)),
    }
}

struct OcrSession {
    client: Client,
    url: String,
}

/// Handle to the remote OCR service.
///
/// Sessions are lazily constructed once per distinct language configuration
/// and reused across sequential calls; the cache lives inside the handle, so
/// the composition root constructs one engine and passes it by reference.
/// Reuse across sequential calls is safe; concurrent callers must serialize
/// access or provision one engine per worker.
pub struct RemoteOcrEngine {
    endpoint: String,
    api_key: Option<String>,
    shape: OcrApiShape,
    sessions: Mutex<HashMap<String, Arc<OcrSession>>>,
}

impl RemoteOcrEngine {
    pub fn from_env() -> Result<Self, ScanError> {
        load_env();
        let endpoint = std::env::var("OCR_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ScanError::ConfigMissing { var: "OCR_ENDPOINT" })?;
        let api_key = std::env::var("OCR_API_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(Self::new(endpoint, api_key, OcrApiShape::from_env()))
    }

    pub fn new(endpoint: String, api_key: Option<String>, shape: OcrApiShape) -> Self {
        RemoteOcrEngine {
            endpoint,
            api_key,
            shape,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self) -> Result<Arc<OcrSession>, ScanError> {
        let lang = std::env::var("OCR_LANG")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "en".to_string());

        let mut sessions = self.sessions.lock().map_err(|_| ScanError::LockPoisoned)?;
        if let Some(session) = sessions.get(&lang) {
            return Ok(Arc::clone(session));
        }

        info!(lang = %lang, "initializing OCR session");
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ScanError::OcrService { detail: e.to_string() })?;
        let url = format!("{}/ocr?lang={}", self.endpoint.trim_end_matches('/'), lang);
        let session = Arc::new(OcrSession { client, url });
        sessions.insert(lang, Arc::clone(&session));
        Ok(session)
    }
}

impl OcrEngine for RemoteOcrEngine {
    fn extract_lines(&self, image_path: &Path) -> Result<Vec<OcrLine>, ScanError> {
        let bytes = fs::read(image_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ScanError::SourceNotFound { path: image_path.to_path_buf() }
            } else {
                ScanError::SourceUnreadable { path: image_path.to_path_buf(), source: e }
            }
        })?;

        let session = self.session()?;
        let mut request = session
            .client
            .post(&session.url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().map_err(|e| {
            let detail = if e.is_connect() || e.is_timeout() {
                "Check the OCR service is running and reachable.".to_string()
            } else {
                e.to_string()
            };
            ScanError::OcrService { detail }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ScanError::OcrService {
                detail: format!(
                    "OCR failed ({}): {}",
                    status,
                    if body.is_empty() { "Invalid key or endpoint?" } else { body.as_str() }
                ),
            });
        }

        let payload: Value = response
            .json()
            .map_err(|e| ScanError::OcrService { detail: format!("Invalid JSON: {}", e) })?;
        let lines = parse_lines(&payload, self.shape);
        debug!(count = lines.len(), "OCR lines recognized");
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rec_arrays_shape_zips_scores() {
        let payload = json!([{
            "rec_texts": ["STORE", " TOTAL 5.00 ", ""],
            "rec_scores": [0.99, 0.87, 0.1]
        }]);
        let lines = parse_lines(&payload, OcrApiShape::RecArrays);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "STORE");
        assert_eq!(lines[0].confidence, Some(0.99));
        assert_eq!(lines[1].text, "TOTAL 5.00");
        assert_eq!(lines[1].confidence, Some(0.87));
    }

    #[test]
    fn rec_arrays_score_length_mismatch_drops_confidence() {
        let payload = json!({
            "rec_texts": ["A LINE", "ANOTHER"],
            "rec_scores": [0.5]
        });
        let lines = parse_lines(&payload, OcrApiShape::RecArrays);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.confidence.is_none()));
    }

    #[test]
    fn line_objects_shape() {
        let payload = json!({
            "lines": [
                {"text": "STORE", "confidence": 0.93},
                {"text": "  ", "confidence": 0.2},
                {"text": "TOTAL 12.00", "confidence": 0.88}
            ]
        });
        let lines = parse_lines(&payload, OcrApiShape::LineObjects);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].text, "TOTAL 12.00");
        assert_eq!(lines[1].confidence, Some(0.88));
    }

    #[test]
    fn shape_mismatch_degrades_to_empty() {
        let payload = json!({"unexpected": "structure"});
        assert!(parse_lines(&payload, OcrApiShape::RecArrays).is_empty());
        assert!(parse_lines(&payload, OcrApiShape::LineObjects).is_empty());

        let non_string_texts = json!({"rec_texts": [1, 2, 3]});
        assert!(parse_lines(&non_string_texts, OcrApiShape::RecArrays).is_empty());

        let empty_pages = json!([]);
        assert!(parse_lines(&empty_pages, OcrApiShape::RecArrays).is_empty());
    }

    #[test]
    fn missing_image_is_source_not_found() {
        let engine = RemoteOcrEngine::new(
            "http://127.0.0.1:1".to_string(),
            None,
            OcrApiShape::RecArrays,
        );
        let err = engine.extract_lines(Path::new("/no/such/image.png")).unwrap_err();
        assert!(matches!(err, ScanError::SourceNotFound { .. }));
    }
}
