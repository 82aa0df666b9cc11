//! Compliance service.
//!
//! PII detection and anonymisation for event text, the GDPR erasure and
//! export workflow over the cold store, and the signed audit trail every
//! personal-data access writes to.

pub mod anonymizer;
pub mod audit;
pub mod gdpr;
pub mod pii;

pub use anonymizer::{AnonymizationMethod, AnonymizedText, Anonymizer, RedactionPolicy};
pub use audit::*;
pub use gdpr::*;
pub use pii::{detect, PiiDetectionResult, PiiMatch, PiiType, RiskLevel};
