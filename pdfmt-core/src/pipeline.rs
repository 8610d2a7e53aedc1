//! Per-page patch production for one chunk.

use crate::collaborators::{
    ContentInterpreter, LayoutDetector, PageJob, PageRasterizer, ParsedPage, PatchSet, Translator,
};
use crate::control::{CancellationToken, Progress};
use crate::error::{Error, Result};
use crate::fonts::FontAssetManager;
use crate::layout::LayoutAnalyzer;
use crate::page_tree;
use lopdf::{Dictionary, Document, Object, Stream};

/// Collaborators and shared state for one pipeline run.
pub struct PipelineContext<'a> {
    pub fonts: &'a FontAssetManager,
    pub translator: &'a dyn Translator,
    pub interpreter: &'a dyn ContentInterpreter,
    pub detector: &'a dyn LayoutDetector,
    pub rasterizer: &'a dyn PageRasterizer,
    pub analyzer: &'a LayoutAnalyzer,
    pub lang_in: &'a str,
    pub lang_out: &'a str,
    pub cancel: &'a CancellationToken,
    pub progress: &'a Progress,
}

#[derive(Debug, Default)]
pub struct PatchPipeline;

impl PatchPipeline {
    pub fn new() -> Self {
        Self
    }

    /// Produce the patches for `indices` of a working copy.
    ///
    /// Each page gets a fresh, empty content stream; the interpreter fills it
    /// through the returned patch set. A page the interpreter leaves unpatched
    /// keeps its previous content.
    pub fn run(&self, doc: &mut Document, indices: &[u32], ctx: &PipelineContext<'_>) -> Result<PatchSet> {
        let mut patches = PatchSet::new();

        for &index in indices {
            if ctx.cancel.is_cancelled() {
                log::info!("Cancellation observed before page {}", index);
                return Err(Error::Cancelled);
            }
            let page_id = page_tree::page_id(doc, index)?;

            let image = ctx
                .rasterizer
                .render(doc, page_id)
                .map_err(|source| Error::Layout { page: index, source })?;
            let boxes = ctx
                .detector
                .detect(&image)
                .map_err(|source| Error::Layout { page: index, source })?;
            let grid = ctx
                .analyzer
                .analyze(image.width() as usize, image.height() as usize, &boxes);

            let content = page_tree::page_content(doc, page_id)?;
            let content_id = doc.add_object(Stream::new(Dictionary::new(), Vec::new()));
            doc.get_dictionary_mut(page_id)?
                .set("Contents", Object::Reference(content_id));

            let page = ParsedPage {
                index,
                page_id,
                content_id,
                content,
                media_box: page_tree::media_box(doc, page_id),
            };
            let job = PageJob {
                page: &page,
                grid: &grid,
                translator: ctx.translator,
                fonts: ctx.fonts,
                lang_in: ctx.lang_in,
                lang_out: ctx.lang_out,
            };
            ctx.interpreter
                .process_page(doc, &job, &mut patches)
                .map_err(|source| Error::PatchApplication { page: index, source })?;

            if !patches.contains(content_id) {
                log::debug!("Page {} left unpatched, keeping its content", index);
                patches.insert(content_id, page.content);
            }
            ctx.progress.advance(&format!("page {}", index + 1));
        }
        Ok(patches)
    }
}
