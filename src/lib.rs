//! mergezero - Pure-Rust bulk document generator
//!
//! This crate merges the rows of a spreadsheet (XLSX) into a DOCX template containing
//! `{{NAME}}` placeholders, producing one document per row, optionally converts the
//! documents into additional formats, and packages everything into one ZIP archive.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mergezero::{GenerateRequest, PipelineBuilder};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PipelineBuilder::new().build()?;
//!     let session = pipeline.new_session();
//!
//!     pipeline.upload_template(&session, "receipt.docx", &std::fs::read("receipt.docx")?)?;
//!     pipeline.upload_dataset(&session, "data.xlsx", &std::fs::read("data.xlsx")?)?;
//!
//!     // Compare placeholders with spreadsheet columns
//!     let validation = pipeline.validate(&session)?;
//!     for warning in &validation.warnings {
//!         println!("warning: {}", warning);
//!     }
//!
//!     // Generate every document and package them
//!     let report = pipeline.generate(&session, &GenerateRequest::new())?;
//!     println!("{} documents: {}", report.documents, report.url);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Without Sessions
//!
//! The building blocks can be used directly:
//!
//! ```rust,no_run
//! use mergezero::{BatchGenerator, Row, Template};
//!
//! # fn main() -> Result<(), mergezero::MergeZeroError> {
//! let template = Template::parse(&std::fs::read("receipt.docx")?)?;
//! let rows = vec![
//!     Row::from_pairs([("Name", "Ana"), ("Amount", "10")]),
//!     Row::from_pairs([("Name", "Bob"), ("Amount", "20")]),
//! ];
//!
//! let result = BatchGenerator::new().generate(&template, &rows);
//! assert!(result.success);
//! // receipt_1_Ana.docx, receipt_2_Bob.docx
//! for artifact in &result.artifacts {
//!     std::fs::write(&artifact.name, &artifact.content)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Custom Configuration
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mergezero::{CollisionPolicy, DeliveryMode, LocalStore, PipelineBuilder};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PipelineBuilder::new()
//!         .with_delivery_mode(DeliveryMode::Materialize)
//!         .with_collision_policy(CollisionPolicy::Reject)
//!         .with_converter_path("/usr/bin/soffice")
//!         .with_object_store(Arc::new(LocalStore::new("/var/lib/mergezero")))
//!         .build()?;
//!     # let _ = pipeline;
//!     Ok(())
//! }
//! ```

mod api;
mod archive;
mod builder;
mod convert;
mod error;
mod formatter;
mod generator;
mod naming;
mod parser;
mod security;
mod session;
mod storage;
mod template;
mod types;
mod validation;

// 公開API
pub use api::{CollisionPolicy, DateFormat, DeliveryMode, SheetSelector};
pub use archive::{ArchiveContents, ArchiveInfo, ArchivePackager};
pub use builder::{
    DatasetUpload, GenerateReport, GenerateRequest, Pipeline, PipelineBuilder, PreviewReport,
    TemplateUpload,
};
pub use convert::{
    convert_batch, ConversionFailure, ConversionOutcome, DocumentConverter, SofficeConverter,
};
pub use error::{MergeZeroError, TemplateError, TemplateIssue};
pub use generator::BatchGenerator;
pub use naming::{resolve_file_name, sanitize_filename};
pub use parser::parse_dataset;
pub use session::{FileKind, MemorySessionStore, SessionFile, SessionStatus, SessionStore};
pub use storage::{LocalStore, MemoryStore, ObjectStore};
pub use template::{extract_placeholders, is_valid_placeholder_name, Template};
pub use types::{Artifact, Dataset, GenerationResult, Row, ValidationResult};
pub use validation::validate_template;
