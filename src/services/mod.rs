pub mod exporter;
pub mod grader;
pub mod identity;
pub mod llm_service;
pub mod recognizer;

pub use exporter::{ExportRecord, Exporter, JsonExporter};
pub use grader::{Grader, LlmGrader};
pub use identity::IdentityResolver;
pub use llm_service::LlmService;
pub use recognizer::{HttpRecognizer, LlmRecognizer, Recognizer};
