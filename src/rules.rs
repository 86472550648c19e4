//! Rule-based candidate extraction over normalized OCR lines.
//!
//! Each generator is a pure function from the normalized line sequence to a
//! ranked candidate list. Generators are independent of each other and
//! deterministic: equal scores keep document order (stable sort), which the
//! tests rely on.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Candidate, OcrLine, RuleCandidateSet};

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b",  // 08/20/10
        r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b",    // 2026-01-05
        r"\b(\d{1,2})-(\d{1,2})-(\d{2,4})\b",  // 08-20-2010
        r"\b(19|20)\d{2}/\d{1,2}/\d{1,2}\b",   // YYYY/MM/DD
        r"\b(19|20)\d{2}\.\d{1,2}\.\d{1,2}\b", // YYYY.MM.DD
    ]
    .iter()
    .map(|p| Regex::new(p).expect("date pattern"))
    .collect()
});

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}:\d{2}(:\d{2})?\b").expect("time pattern"));

/// Money token: optional thousands separators, mandatory 2-digit fraction.
/// Word boundaries are enforced separately in `first_money_token`.
static MONEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{1,3}(?:[.,]\d{3})*[.,]\d{2}|\d+[.,]\d{2}").expect("money pattern")
});

static MERCHANT_NOISE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(open|hours|tel|phone|tr#|st#|tc#)\b").expect("noise pattern"));

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\d{3}\)\d").expect("phone pattern"));

static CODE_USD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bUSD\b").expect("USD pattern"));
static CODE_EUR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bEUR\b").expect("EUR pattern"));

/// Trimmed, non-empty text lines in document order. This sequence is the
/// single source of truth that every candidate and every evidence citation
/// refers back to; per-line confidence is dropped for the heuristic path.
pub fn normalize_lines(ocr_lines: &[OcrLine]) -> Vec<String> {
    ocr_lines
        .iter()
        .map(|l| l.text.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn sort_best_first(cands: &mut Vec<Candidate>, keep: usize) {
    // sort_by is stable: ties keep encounter (document) order
    cands.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    cands.truncate(keep);
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// First money-looking token on a line that is not embedded in a longer word
/// or number. A rejected position rescans one character forward so a later
/// valid token on the same line is still found.
pub(crate) fn first_money_token(line: &str) -> Option<&str> {
    let mut at = 0;
    while let Some(m) = MONEY_RE.find_at(line, at) {
        let before_ok = line[..m.start()]
            .chars()
            .next_back()
            .map_or(true, |c| !is_word_char(c));
        let after_ok = line[m.end()..].chars().next().map_or(true, |c| !is_word_char(c));
        if before_ok && after_ok {
            return Some(m.as_str());
        }
        at = m.start()
            + line[m.start()..]
                .chars()
                .next()
                .map_or(1, |c| c.len_utf8());
    }
    None
}

/// Likely receipt dates. Covers MM/DD/YY[YY], YYYY-MM-DD, MM-DD-YY[YY],
/// YYYY/MM/DD and YYYY.MM.DD.
pub fn find_date_candidates(lines: &[String]) -> Vec<Candidate> {
    let mut cands = Vec::new();

    for (i, ln) in lines.iter().enumerate() {
        for pat in DATE_PATTERNS.iter() {
            let Some(m) = pat.find(ln) else { continue };
            // dates near the bottom often appear with a time stamp
            let mut score = 0.6;
            if TIME_RE.is_match(ln) {
                score += 0.2;
            }
            if i as f64 > lines.len() as f64 * 0.6 {
                score += 0.1;
            }
            cands.push(Candidate {
                value: m.as_str().to_string(),
                line_index: i,
                line_text: ln.clone(),
                score,
            });
        }
    }

    sort_best_first(&mut cands, 5);
    cands
}

/// Likely totals, keyed off anchor phrases. The amount is taken from the
/// anchor line itself, or from the immediately following line (common
/// two-line receipt layout). Without any anchored hit, the last money-looking
/// number near the bottom is a weak fallback.
pub fn find_total_candidates(lines: &[String]) -> Vec<Candidate> {
    const ANCHORS: [&str; 5] = ["total", "amount due", "balance due", "grand total", "to pay"];
    let mut cands = Vec::new();

    for (i, ln) in lines.iter().enumerate() {
        let low = ln.to_lowercase();
        if !ANCHORS.iter().any(|a| low.contains(a)) {
            continue;
        }

        if let Some(amt) = first_money_token(ln) {
            let mut score = 0.8;
            if low.contains("total") {
                score += 0.1;
            }
            cands.push(Candidate {
                value: amt.to_string(),
                line_index: i,
                line_text: ln.clone(),
                score,
            });
            continue;
        }

        if i + 1 < lines.len() {
            if let Some(amt) = first_money_token(&lines[i + 1]) {
                cands.push(Candidate {
                    value: amt.to_string(),
                    line_index: i + 1,
                    line_text: lines[i + 1].clone(),
                    score: 0.75,
                });
            }
        }
    }

    if cands.is_empty() {
        for i in (lines.len().saturating_sub(11)..lines.len()).rev() {
            if let Some(amt) = first_money_token(&lines[i]) {
                cands.push(Candidate {
                    value: amt.to_string(),
                    line_index: i,
                    line_text: lines[i].clone(),
                    score: 0.4,
                });
                break;
            }
        }
    }

    sort_best_first(&mut cands, 5);
    cands
}

/// Currency from symbols and common explicit codes. Whole-word codes outrank
/// symbol-only detection.
pub fn find_currency_candidates(lines: &[String]) -> Vec<Candidate> {
    let mut cands = Vec::new();

    for (i, ln) in lines.iter().enumerate() {
        let mut push = |code: &str, score: f64| {
            cands.push(Candidate {
                value: code.to_string(),
                line_index: i,
                line_text: ln.clone(),
                score,
            });
        };
        if ln.contains('$') {
            push("USD", 0.6);
        }
        if ln.contains('€') {
            push("EUR", 0.6);
        }
        if ln.contains('£') {
            push("GBP", 0.6);
        }
        if CODE_USD_RE.is_match(ln) {
            push("USD", 0.7);
        }
        if CODE_EUR_RE.is_match(ln) {
            push("EUR", 0.7);
        }
    }

    sort_best_first(&mut cands, 3);
    cands
}

fn is_fully_upper(s: &str) -> bool {
    let mut has_cased = false;
    for c in s.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}

/// Store names sit in the first few lines, often in all caps. Operational
/// noise (opening hours, phone numbers, register IDs) is skipped.
pub fn find_merchant_candidates(lines: &[String]) -> Vec<Candidate> {
    let mut cands = Vec::new();

    for (i, ln) in lines.iter().take(8).enumerate() {
        if ln.chars().count() < 3 {
            continue;
        }
        if MERCHANT_NOISE_RE.is_match(&ln.to_lowercase()) {
            continue;
        }
        if PHONE_RE.is_match(ln) {
            continue;
        }

        let mut score = 0.5;
        if is_fully_upper(ln) {
            score += 0.2;
        }
        if i == 0 {
            score += 0.2;
        }
        cands.push(Candidate {
            value: ln.clone(),
            line_index: i,
            line_text: ln.clone(),
            score,
        });
    }

    sort_best_first(&mut cands, 5);
    cands
}

/// Aggregate the four generator outputs into one ranked candidate set.
pub fn build_rule_candidates(lines: &[String]) -> RuleCandidateSet {
    RuleCandidateSet {
        merchant: find_merchant_candidates(lines),
        date: find_date_candidates(lines),
        total: find_total_candidates(lines),
        currency: find_currency_candidates(lines),
        line_count: lines.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    fn assert_ranked(cands: &[Candidate]) {
        for pair in cands.windows(2) {
            assert!(
                pair[0].score >= pair[1].score,
                "not sorted: {:?} before {:?}",
                pair[0],
                pair[1]
            );
            if (pair[0].score - pair[1].score).abs() < f64::EPSILON {
                assert!(
                    pair[0].line_index <= pair[1].line_index,
                    "tie broke document order: {:?} before {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    fn assert_grounded(cands: &[Candidate], lines: &[String]) {
        for c in cands {
            assert_eq!(c.line_text, lines[c.line_index], "candidate not grounded: {c:?}");
        }
    }

    #[test]
    fn normalize_trims_and_drops_empties() {
        let raw = vec![
            OcrLine { text: "  STORE  ".into(), confidence: Some(0.99) },
            OcrLine { text: "   ".into(), confidence: Some(0.2) },
            OcrLine { text: "TOTAL 5.00".into(), confidence: None },
        ];
        assert_eq!(normalize_lines(&raw), vec!["STORE".to_string(), "TOTAL 5.00".to_string()]);
    }

    #[test]
    fn total_anchor_line_scores_high() {
        let ls = lines(&["STORE", "Total: 42.50"]);
        let cands = find_total_candidates(&ls);
        assert_eq!(cands[0].value, "42.50");
        assert_eq!(cands[0].line_index, 1);
        assert!(cands[0].score >= 0.8);
        assert_grounded(&cands, &ls);
    }

    #[test]
    fn total_amount_on_following_line() {
        let ls = lines(&["ITEM 3.00", "TOTAL", "12.00"]);
        let cands = find_total_candidates(&ls);
        assert_eq!(cands[0].value, "12.00");
        assert_eq!(cands[0].line_index, 2);
        assert!((cands[0].score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn total_falls_back_to_bottom_scan() {
        let ls = lines(&["STORE", "ITEM A", "19.99", "THANK YOU"]);
        let cands = find_total_candidates(&ls);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].value, "19.99");
        assert!((cands[0].score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn money_token_respects_word_boundaries() {
        assert_eq!(first_money_token("Total 42.50"), Some("42.50"));
        assert_eq!(first_money_token("$1,234.56 due"), Some("1,234.56"));
        // embedded prefix is rejected, later start inside it still matches
        assert_eq!(first_money_token("ref a1,234.56"), Some("234.56"));
        assert_eq!(first_money_token("code 12.345"), None);
        assert_eq!(first_money_token("no numbers here"), None);
    }

    #[test]
    fn date_found_at_expected_index() {
        let ls = lines(&["STORE", "123 MAIN ST", "ITEM 1.00", "2026-01-05"]);
        let cands = find_date_candidates(&ls);
        assert_eq!(cands[0].value, "2026-01-05");
        assert_eq!(cands[0].line_index, 3);
        assert_grounded(&cands, &ls);
    }

    #[test]
    fn date_with_time_near_bottom_outranks_header_date() {
        let ls = lines(&[
            "01/01/2020",
            "ITEM",
            "ITEM",
            "ITEM",
            "ITEM",
            "ITEM",
            "ITEM",
            "ITEM",
            "01/02/2024 13:45",
        ]);
        let cands = find_date_candidates(&ls);
        assert_eq!(cands[0].value, "01/02/2024");
        assert_eq!(cands[0].line_index, 8);
        // base 0.6 + time 0.2 + bottom 0.1
        assert!((cands[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn currency_symbol_maps_to_code() {
        let ls = lines(&["COFFEE $19.99"]);
        let cands = find_currency_candidates(&ls);
        assert_eq!(cands[0].value, "USD");
        assert!((cands[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn currency_explicit_code_beats_symbol() {
        let ls = lines(&["PRICE $10.00", "PAID IN EUR"]);
        let cands = find_currency_candidates(&ls);
        assert_eq!(cands[0].value, "EUR");
        assert!((cands[0].score - 0.7).abs() < 1e-9);
        assert_ranked(&cands);
    }

    #[test]
    fn currency_code_requires_whole_word() {
        let ls = lines(&["PSEUDO-FIELD EURX"]);
        assert!(find_currency_candidates(&ls).is_empty());
    }

    #[test]
    fn merchant_prefers_first_uppercase_line() {
        let ls = lines(&["WALMART", "Save money. Live better.", "OPEN 24 HOURS", "(800)9256278"]);
        let cands = find_merchant_candidates(&ls);
        assert_eq!(cands[0].value, "WALMART");
        // base 0.5 + upper 0.2 + first line 0.2
        assert!((cands[0].score - 0.9).abs() < 1e-9);
        assert!(cands.iter().all(|c| c.value != "OPEN 24 HOURS"));
        assert!(cands.iter().all(|c| c.value != "(800)9256278"));
    }

    #[test]
    fn merchant_only_scans_document_head() {
        let mut texts: Vec<&str> = vec!["aa"; 9];
        texts.push("LATE ALL CAPS NAME");
        let ls = lines(&texts);
        // line 9 is beyond the 8-line head, "aa" lines are too short
        assert!(find_merchant_candidates(&ls).is_empty());
    }

    #[test]
    fn generators_sort_stable_and_grounded() {
        let ls = lines(&[
            "CORNER DELI",
            "SANDWICH 8.00",
            "COFFEE 3.50",
            "Subtotal 11.50",
            "Total 12.42",
            "$12.42",
            "01/02/2024 09:15",
        ]);
        let set = build_rule_candidates(&ls);
        assert_eq!(set.line_count, 7);
        for cands in [&set.merchant, &set.date, &set.total, &set.currency] {
            assert_ranked(cands);
            assert_grounded(cands, &ls);
        }
    }

    #[test]
    fn equal_scores_keep_document_order() {
        let ls = lines(&["$1.00", "$2.00", "$3.00"]);
        let cands = find_currency_candidates(&ls);
        assert_eq!(cands.len(), 3);
        assert_eq!(
            cands.iter().map(|c| c.line_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn empty_input_produces_empty_set() {
        let set = build_rule_candidates(&[]);
        assert!(set.merchant.is_empty());
        assert!(set.date.is_empty());
        assert!(set.total.is_empty());
        assert!(set.currency.is_empty());
        assert_eq!(set.line_count, 0);
    }
}
