//! PDF Translation Core
//!
//! Layout-aware, chunked rewriting of PDF documents: selected pages are
//! translated block by block while figures, tables and formulas stay as they
//! are, producing a translated-only document and a side-by-side one.

pub mod collaborators;
pub mod control;
pub mod dual;
pub mod error;
pub mod fonts;
pub mod interpreter;
pub mod layout;
pub mod page_selector;
pub mod page_tree;
pub mod pipeline;
pub mod processor;

// Re-export commonly used functions and types
pub use collaborators::{
    CachedTranslator, ContentInterpreter, LayoutDetector, MediaBoxRasterizer, PageJob,
    PageRasterizer, ParsedPage, PatchSet, Translator, WholePageDetector,
};
pub use control::{CancellationToken, Progress, ProgressCallback};
pub use dual::DualDocumentSynthesizer;
pub use error::{Error, FontError, Result, TranslateError};
pub use fonts::{FontAsset, FontAssetManager, FontProvider, InstalledFonts, LocalFontProvider};
pub use interpreter::BlockTextInterpreter;
pub use layout::{LayoutAnalyzer, LayoutBox, OccupancyGrid};
pub use page_selector::{PageSelection, PageSelector};
pub use pipeline::{PatchPipeline, PipelineContext};
pub use processor::{
    ChunkedDocumentProcessor, Collaborators, PartialTranslation, ProcessOptions, ProcessOutcome,
    TranslatedDocuments,
};

pub use image;
pub use lopdf;
