//! Error types for the translation core.
//!
//! Only document, font-resolution and patch-application errors abort a run.
//! Subsetting and resource-binding problems are logged where they happen and
//! never surface through [`Error`].

use thiserror::Error;

/// Fatal and terminal conditions of a processing run.
#[derive(Error, Debug)]
pub enum Error {
    /// The source bytes could not be parsed as a PDF.
    #[error("invalid source document: {0}")]
    InvalidDocument(#[source] lopdf::Error),

    /// A structural operation on a parsed document failed.
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    /// Writing a serialized document or an encoded stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page index has no page object in the document.
    #[error("page {0} not found")]
    PageNotFound(u32),

    /// The font asset for the target language could not be resolved or loaded.
    #[error("font resolution failed: {0}")]
    FontResolution(#[source] anyhow::Error),

    /// Rendering or layout detection failed for a page.
    #[error("layout analysis failed on page {page}: {source}")]
    Layout {
        page: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The content-stream interpreter failed on a page. A translated page
    /// must never be silently skipped, so this aborts the run.
    #[error("patch application failed on page {page}: {source}")]
    PatchApplication {
        page: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Cooperative cancellation was observed.
    #[error("translation cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Non-fatal font post-processing failures (metrics, subsetting).
#[derive(Error, Debug)]
pub enum FontError {
    #[error("font program for {name} is not embedded")]
    MissingProgram { name: String },

    #[error("failed to subset {name}: {message}")]
    Subset { name: String, message: String },

    #[error("failed to scan content streams: {0}")]
    Scan(#[from] lopdf::Error),

    #[error("failed to encode font program: {0}")]
    Encode(#[from] std::io::Error),
}

/// Failure reported by a translation capability.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslateError {
    /// The request can never succeed (bad credentials, unsupported pair).
    #[error("fatal translation error: {0}")]
    Fatal(String),

    /// The request may succeed if attempted again (timeouts, rate limits).
    #[error("retryable translation error: {0}")]
    Retryable(String),
}

impl TranslateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TranslateError::Retryable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
