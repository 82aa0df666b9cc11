//! PII detection and masking.
//!
//! Detects personally identifiable information in free text:
//! - Email addresses
//! - Credit card numbers (Luhn-checked for confidence)
//! - SSNs
//! - IPv4 addresses
//! - Phone numbers
//! - Passport numbers
//!
//! Matches never overlap; substitution is done from the collected spans so
//! several matches in one text are replaced without offset drift.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::compute_hash_parts;
use crate::logging::structured::LogContext;

lazy_static! {
    /// Email pattern
    static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// Credit card pattern (four groups of four)
    static ref CC_PATTERN: Regex = Regex::new(
        r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"
    ).unwrap();

    /// SSN pattern
    static ref SSN_PATTERN: Regex = Regex::new(
        r"\b\d{3}-\d{2}-\d{4}\b"
    ).unwrap();

    /// IP address pattern (IPv4)
    static ref IP_PATTERN: Regex = Regex::new(
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"
    ).unwrap();

    /// Phone number pattern
    static ref PHONE_PATTERN: Regex = Regex::new(
        r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b"
    ).unwrap();

    /// Passport pattern
    static ref PASSPORT_PATTERN: Regex = Regex::new(
        r"\b[A-Z]{1,2}\d{6,9}\b"
    ).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    CreditCard,
    Ssn,
    IpAddress,
    Phone,
    Passport,
}

impl PiiType {
    /// Detection order; earlier types win ties on the same start offset.
    pub const ALL: [PiiType; 6] = [
        PiiType::Email,
        PiiType::CreditCard,
        PiiType::Ssn,
        PiiType::IpAddress,
        PiiType::Phone,
        PiiType::Passport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiType::Email => "email",
            PiiType::CreditCard => "credit_card",
            PiiType::Ssn => "ssn",
            PiiType::IpAddress => "ip_address",
            PiiType::Phone => "phone",
            PiiType::Passport => "passport",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            PiiType::Email => &EMAIL_PATTERN,
            PiiType::CreditCard => &CC_PATTERN,
            PiiType::Ssn => &SSN_PATTERN,
            PiiType::IpAddress => &IP_PATTERN,
            PiiType::Phone => &PHONE_PATTERN,
            PiiType::Passport => &PASSPORT_PATTERN,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, PiiType::CreditCard | PiiType::Ssn | PiiType::Passport)
    }

    /// Risk a single occurrence contributes.
    pub fn risk(&self) -> RiskLevel {
        match self {
            PiiType::CreditCard | PiiType::Ssn | PiiType::Passport => RiskLevel::Critical,
            PiiType::Email | PiiType::Phone => RiskLevel::Medium,
            PiiType::IpAddress => RiskLevel::Low,
        }
    }
}

impl fmt::Display for PiiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiMatch {
    pub pii_type: PiiType,
    pub value: String,
    pub start: usize,
    pub end: usize,
    pub masked: String,
    pub confidence: f64,
    pub risk: RiskLevel,
}

/// PII detection result.
#[derive(Debug, Clone, PartialEq)]
pub struct PiiDetectionResult {
    pub matches: Vec<PiiMatch>,
    pub risk_level: RiskLevel,
}

impl Default for PiiDetectionResult {
    fn default() -> Self {
        Self {
            matches: Vec::new(),
            risk_level: RiskLevel::Low,
        }
    }
}

impl PiiDetectionResult {
    pub fn has_pii(&self) -> bool {
        !self.matches.is_empty()
    }

    pub fn count(&self, pii_type: PiiType) -> usize {
        self.matches.iter().filter(|m| m.pii_type == pii_type).count()
    }
}

/// Link from a stored event to a detected PII value. The value itself is
/// kept only as a salted hash, see [`occurrence_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiOccurrence {
    pub field: String,
    pub pii_type: PiiType,
    pub value_hash: String,
    pub redacted: bool,
}

/// Overall risk: critical if any card/SSN/passport, high at three or more
/// matches, medium at one or more, else low.
pub fn risk_level(matches: &[PiiMatch]) -> RiskLevel {
    if matches.iter().any(|m| m.pii_type.is_critical()) {
        RiskLevel::Critical
    } else if matches.len() >= 3 {
        RiskLevel::High
    } else if !matches.is_empty() {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Detect PII in a string.
pub fn detect(text: &str) -> PiiDetectionResult {
    let mut candidates: Vec<(usize, PiiMatch)> = Vec::new();
    for (order, pii_type) in PiiType::ALL.iter().enumerate() {
        for found in pii_type.pattern().find_iter(text) {
            let value = found.as_str();
            candidates.push((
                order,
                PiiMatch {
                    pii_type: *pii_type,
                    value: value.to_string(),
                    start: found.start(),
                    end: found.end(),
                    masked: mask_value(*pii_type, value),
                    confidence: confidence(*pii_type, value),
                    risk: pii_type.risk(),
                },
            ));
        }
    }

    // Leftmost first, longer span first, then detection order.
    candidates.sort_by(|(oa, a), (ob, b)| {
        a.start
            .cmp(&b.start)
            .then((b.end - b.start).cmp(&(a.end - a.start)))
            .then(oa.cmp(ob))
    });

    let mut matches: Vec<PiiMatch> = Vec::new();
    let mut cursor = 0;
    for (_, candidate) in candidates {
        if candidate.start < cursor {
            continue;
        }
        cursor = candidate.end;
        matches.push(candidate);
    }

    let risk_level = risk_level(&matches);
    PiiDetectionResult {
        matches,
        risk_level,
    }
}

/// Replace every match span with `render(match)`.
pub fn substitute<F>(text: &str, matches: &[PiiMatch], mut render: F) -> String
where
    F: FnMut(&PiiMatch) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in matches {
        if m.start < cursor || m.end > text.len() {
            continue;
        }
        out.push_str(&text[cursor..m.start]);
        out.push_str(&render(m));
        cursor = m.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Detect and mask PII in a string.
pub fn mask_text(text: &str) -> (String, PiiDetectionResult) {
    let result = detect(text);
    let masked = substitute(text, &result.matches, |m| m.masked.clone());
    (masked, result)
}

/// Type-specific redaction pattern for a single value.
pub fn mask_value(pii_type: PiiType, value: &str) -> String {
    match pii_type {
        PiiType::Email => mask_email(value),
        PiiType::CreditCard => format!("**** **** **** {}", last_digits(value, 4)),
        PiiType::Ssn => format!("***-**-{}", last_digits(value, 4)),
        PiiType::IpAddress => {
            let octets: Vec<&str> = value.split('.').collect();
            if octets.len() == 4 {
                format!("{}.{}.*.*", octets[0], octets[1])
            } else {
                "*.*.*.*".to_string()
            }
        }
        PiiType::Phone => format!("***-***-{}", last_digits(value, 4)),
        PiiType::Passport => {
            let chars: Vec<char> = value.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(3)..].iter().collect();
            format!("**{}", tail)
        }
    }
}

fn mask_email(value: &str) -> String {
    let (local, domain) = match value.split_once('@') {
        Some(parts) => parts,
        None => return "***@*****".to_string(),
    };
    let first_local = local.chars().next().unwrap_or('*');
    let first_domain = domain.chars().next().unwrap_or('*');
    let tld = domain.rsplit('.').next().unwrap_or("");
    format!("{}***@{}*****.{}", first_local, first_domain, tld)
}

fn last_digits(value: &str, n: usize) -> String {
    let digits: Vec<char> = value.chars().filter(|c| c.is_ascii_digit()).collect();
    digits[digits.len().saturating_sub(n)..].iter().collect()
}

fn confidence(pii_type: PiiType, value: &str) -> f64 {
    match pii_type {
        PiiType::Email => {
            let local_len = value.split('@').next().map(str::len).unwrap_or(0);
            if local_len > 1 {
                0.95
            } else {
                0.80
            }
        }
        PiiType::CreditCard => {
            if luhn_valid(value) {
                0.98
            } else {
                0.70
            }
        }
        PiiType::Ssn => 0.90,
        PiiType::IpAddress => 0.85,
        PiiType::Phone | PiiType::Passport => 0.75,
    }
}

/// Luhn checksum over the digits of `value`.
pub fn luhn_valid(value: &str) -> bool {
    let digits: Vec<u32> = value.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 12 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                *d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Detect PII in every string of a JSON document, keyed by dot path.
pub fn detect_in_value(value: &Value, ctx: &LogContext) -> Vec<(String, PiiMatch)> {
    let mut found = Vec::new();
    walk_value(value, String::new(), &mut found);
    if !found.is_empty() {
        log::debug!("{} PII_DETECTED_IN_DOCUMENT matches={}", ctx, found.len());
    }
    found
}

fn walk_value(value: &Value, path: String, found: &mut Vec<(String, PiiMatch)>) {
    match value {
        Value::String(s) => {
            for m in detect(s).matches {
                found.push((path.clone(), m));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk_value(item, join_path(&path, &i.to_string()), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                walk_value(item, join_path(&path, key), found);
            }
        }
        _ => {}
    }
}

fn join_path(prefix: &str, part: &str) -> String {
    if prefix.is_empty() {
        part.to_string()
    } else {
        format!("{}.{}", prefix, part)
    }
}

/// Salted hash linking a PII value to the events it was redacted from.
/// Erasure recomputes it from the subject identifier.
pub fn occurrence_hash(salt: &str, value: &str) -> String {
    compute_hash_parts(&["pii:", salt, ":", &value.trim().to_lowercase()])
}

/// Occurrence record for a match found in `field`.
pub fn occurrence(field: &str, m: &PiiMatch, redacted: bool, salt: &str) -> PiiOccurrence {
    PiiOccurrence {
        field: field.to_string(),
        pii_type: m.pii_type,
        value_hash: occurrence_hash(salt, &m.value),
        redacted,
    }
}
