pub mod document;
pub mod record;
pub mod stats;

pub use document::DocumentRef;
pub use record::{
    Confidence, DocumentQuality, ExtractedFields, ExtractionRecord, FieldValue, ReadStatus,
};
pub use stats::RunStats;
