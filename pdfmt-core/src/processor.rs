//! Chunked processing loop.
//!
//! Selected pages are translated a chunk at a time on a fresh working copy of
//! the original, and the translated pages are merged into a mono accumulator
//! that starts as a plain copy of the original. Pages outside the selection
//! are never touched.

use crate::collaborators::{
    ContentInterpreter, LayoutDetector, MediaBoxRasterizer, PageRasterizer, Translator,
};
use crate::control::{CancellationToken, Progress, ProgressCallback};
use crate::dual::DualDocumentSynthesizer;
use crate::error::{Error, Result};
use crate::fonts::FontAssetManager;
use crate::interpreter::BlockTextInterpreter;
use crate::layout::LayoutAnalyzer;
use crate::page_selector::{PageSelection, PageSelector};
use crate::page_tree;
use crate::pipeline::{PatchPipeline, PipelineContext};
use lopdf::Document;
use std::sync::Arc;

pub const DEFAULT_CHUNK_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub lang_in: String,
    pub lang_out: String,
    /// Zero-based page indices; `None` translates every page.
    pub pages: Option<Vec<i64>>,
    pub chunk_size: usize,
    pub skip_subset_fonts: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            lang_in: "en".to_string(),
            lang_out: "zh".to_string(),
            pages: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_subset_fonts: false,
        }
    }
}

/// External capabilities used by the processor.
#[derive(Clone)]
pub struct Collaborators {
    pub translator: Arc<dyn Translator>,
    pub detector: Arc<dyn LayoutDetector>,
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub interpreter: Arc<dyn ContentInterpreter>,
}

impl Collaborators {
    /// Blank-canvas rasterizer and the block-text interpreter with a
    /// translation pool of `threads` workers.
    pub fn with_defaults(
        translator: Arc<dyn Translator>,
        detector: Arc<dyn LayoutDetector>,
        threads: usize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            translator,
            detector,
            rasterizer: Arc::new(MediaBoxRasterizer::default()),
            interpreter: Arc::new(BlockTextInterpreter::new(threads)?),
        })
    }
}

/// Serialized outputs of a completed run.
#[derive(Debug, Clone)]
pub struct TranslatedDocuments {
    pub mono: Vec<u8>,
    pub dual: Vec<u8>,
}

/// State of the accumulator when a run is cancelled. Pages of completed
/// chunks are translated, every other page is the original.
#[derive(Debug)]
pub struct PartialTranslation {
    pub mono: Document,
    pub merged_pages: Vec<u32>,
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Completed(TranslatedDocuments),
    Cancelled(PartialTranslation),
}

pub struct ChunkedDocumentProcessor {
    options: ProcessOptions,
    fonts: FontAssetManager,
    collaborators: Collaborators,
    analyzer: LayoutAnalyzer,
}

impl ChunkedDocumentProcessor {
    pub fn new(options: ProcessOptions, fonts: FontAssetManager, collaborators: Collaborators) -> Self {
        Self {
            options,
            fonts,
            collaborators,
            analyzer: LayoutAnalyzer::default(),
        }
    }

    pub fn with_analyzer(mut self, analyzer: LayoutAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    /// Translate `original` and build both output documents.
    pub fn process(
        &self,
        original: &[u8],
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<ProcessOutcome> {
        log::debug!("state: Initialized");
        let source = Document::load_mem(original).map_err(Error::InvalidDocument)?;
        let total_pages = source.get_pages().len() as u32;
        let selection = PageSelector::new(total_pages).select(self.options.pages.as_deref());
        let mut mono = source.clone();

        let progress = Progress::new(selection.to_translate.len(), progress);
        let chunk_size = self.options.chunk_size.max(1);
        let pages: Vec<u32> = selection.to_translate.iter().copied().collect();
        let chunks: Vec<&[u32]> = pages.chunks(chunk_size).collect();
        let mut merged_pages = Vec::new();

        for (number, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(mono, merged_pages));
            }
            log::info!(
                "Chunk {}/{}: pages {:?}",
                number + 1,
                chunks.len(),
                chunk
            );
            match self.translate_chunk(original, chunk, cancel, &progress) {
                Ok(fragments) => {
                    log::debug!("state: Merge");
                    page_tree::replace_pages(&mut mono, fragments)?;
                    merged_pages.extend_from_slice(chunk);
                }
                Err(Error::Cancelled) => return Ok(self.cancelled(mono, merged_pages)),
                Err(e) => {
                    log::error!("Chunk {} failed: {}", number + 1, e);
                    return Err(e);
                }
            }
        }

        log::debug!("state: Finalize");
        self.finalize(&source, mono, &selection)
    }

    /// Translate one chunk on a fresh working copy and return its pages as
    /// standalone single-page documents.
    fn translate_chunk(
        &self,
        original: &[u8],
        chunk: &[u32],
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> Result<Vec<(u32, Document)>> {
        log::debug!("state: Snapshot");
        let mut working = Document::load_mem(original).map_err(Error::InvalidDocument)?;

        log::debug!("state: InstallFonts");
        let installed = self.fonts.install(&mut working)?;
        self.fonts.bind_resources(&mut working, &installed);

        log::debug!("state: Patch");
        let ctx = PipelineContext {
            fonts: &self.fonts,
            translator: self.collaborators.translator.as_ref(),
            interpreter: self.collaborators.interpreter.as_ref(),
            detector: self.collaborators.detector.as_ref(),
            rasterizer: self.collaborators.rasterizer.as_ref(),
            analyzer: &self.analyzer,
            lang_in: &self.options.lang_in,
            lang_out: &self.options.lang_out,
            cancel,
            progress,
        };
        let patches = PatchPipeline::new().run(&mut working, chunk, &ctx)?;

        log::debug!("state: ApplyPatches");
        let applied = patches.apply(&mut working)?;
        log::debug!("Applied {} patches", applied);
        if let Err(e) = self.fonts.embed_glyph_metrics(&mut working) {
            log::warn!("Glyph metrics not embedded: {}", e);
        }

        if self.options.skip_subset_fonts {
            log::debug!("Font subsetting skipped");
        } else {
            log::debug!("state: Subset");
            if let Err(e) = self.fonts.subset(&mut working) {
                log::warn!("Keeping full fonts for this chunk: {}", e);
            }
        }

        log::debug!("state: ExtractPages");
        let mut fragments = Vec::with_capacity(chunk.len());
        for &index in chunk {
            let page_id = page_tree::page_id(&working, index)?;
            fragments.push((index, page_tree::extract_page(&working, page_id)?));
        }
        Ok(fragments)
    }

    fn finalize(
        &self,
        source: &Document,
        mut mono: Document,
        selection: &PageSelection,
    ) -> Result<ProcessOutcome> {
        let fonts = (!self.options.skip_subset_fonts).then_some(&self.fonts);
        let mut dual = DualDocumentSynthesizer::new(fonts).synthesize(source, &mono)?;
        let mono = page_tree::serialize(&mut mono)?;
        let dual = page_tree::serialize(&mut dual)?;
        log::info!(
            "Translated {} of {} pages",
            selection.to_translate.len(),
            selection.total()
        );
        log::debug!("state: Done");
        Ok(ProcessOutcome::Completed(TranslatedDocuments { mono, dual }))
    }

    fn cancelled(&self, mono: Document, merged_pages: Vec<u32>) -> ProcessOutcome {
        log::info!(
            "state: Cancelled after merging {} pages",
            merged_pages.len()
        );
        ProcessOutcome::Cancelled(PartialTranslation { mono, merged_pages })
    }
}
