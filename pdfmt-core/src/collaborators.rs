//! Capabilities the pipeline depends on but does not implement itself:
//! translation, layout detection, page rendering and content rewriting.

use crate::error::{Result, TranslateError};
use crate::fonts::FontAssetManager;
use crate::layout::{LayoutBox, OccupancyGrid};
use crate::page_tree;
use image::{Rgb, RgbImage};
use lopdf::{Document, ObjectId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Text translation service.
pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, lang_in: &str, lang_out: &str)
        -> std::result::Result<String, TranslateError>;

    /// Identifies the service in cache keys.
    fn service_id(&self) -> &str;
}

impl<T: Translator + ?Sized> Translator for std::sync::Arc<T> {
    fn translate(
        &self,
        text: &str,
        lang_in: &str,
        lang_out: &str,
    ) -> std::result::Result<String, TranslateError> {
        (**self).translate(text, lang_in, lang_out)
    }

    fn service_id(&self) -> &str {
        (**self).service_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    text: String,
    lang_in: String,
    lang_out: String,
    service: String,
}

/// Memoizing, retrying wrapper around another [`Translator`].
pub struct CachedTranslator<T> {
    inner: T,
    cache: Mutex<HashMap<CacheKey, String>>,
    ignore_cache: bool,
    max_retries: u32,
}

impl<T: Translator> CachedTranslator<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            ignore_cache: false,
            max_retries: 2,
        }
    }

    /// Skip lookups. Fresh results are still stored.
    pub fn ignore_cache(mut self, ignore: bool) -> Self {
        self.ignore_cache = ignore;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: Translator> Translator for CachedTranslator<T> {
    fn translate(
        &self,
        text: &str,
        lang_in: &str,
        lang_out: &str,
    ) -> std::result::Result<String, TranslateError> {
        let key = CacheKey {
            text: text.to_string(),
            lang_in: lang_in.to_string(),
            lang_out: lang_out.to_string(),
            service: self.inner.service_id().to_string(),
        };
        if !self.ignore_cache {
            if let Some(hit) = self.cache.lock().get(&key) {
                return Ok(hit.clone());
            }
        }

        let mut attempt = 0;
        loop {
            match self.inner.translate(text, lang_in, lang_out) {
                Ok(translated) => {
                    self.cache.lock().insert(key, translated.clone());
                    return Ok(translated);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "{} failed ({}), retry {}/{}",
                        self.inner.service_id(),
                        e,
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn service_id(&self) -> &str {
        self.inner.service_id()
    }
}

/// Classifies regions of a rendered page.
pub trait LayoutDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<LayoutBox>>;
}

/// Treats the whole page as a single text block.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholePageDetector;

impl LayoutDetector for WholePageDetector {
    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<LayoutBox>> {
        Ok(vec![LayoutBox::new(
            "text",
            0.0,
            0.0,
            image.width() as f32,
            image.height() as f32,
        )])
    }
}

/// Renders one page to an RGB raster for layout detection.
pub trait PageRasterizer: Send + Sync {
    fn render(&self, doc: &Document, page_id: ObjectId) -> anyhow::Result<RgbImage>;
}

/// Blank canvas with the page box dimensions.
#[derive(Debug, Clone, Copy)]
pub struct MediaBoxRasterizer {
    scale: f32,
}

impl Default for MediaBoxRasterizer {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl MediaBoxRasterizer {
    /// `scale` is pixels per PDF point.
    pub fn new(scale: f32) -> Self {
        Self {
            scale: if scale > 0.0 { scale } else { 1.0 },
        }
    }
}

impl PageRasterizer for MediaBoxRasterizer {
    fn render(&self, doc: &Document, page_id: ObjectId) -> anyhow::Result<RgbImage> {
        let (width, height) = page_tree::page_size(doc, page_id);
        let w = ((width * self.scale).ceil() as u32).max(1);
        let h = ((height * self.scale).ceil() as u32).max(1);
        Ok(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])))
    }
}

/// A page prepared for rewriting.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub index: u32,
    pub page_id: ObjectId,
    /// Fresh, empty stream `/Contents` now points at.
    pub content_id: ObjectId,
    /// The page's content before rewriting, decoded.
    pub content: Vec<u8>,
    pub media_box: [f32; 4],
}

impl ParsedPage {
    pub fn width(&self) -> f32 {
        self.media_box[2] - self.media_box[0]
    }

    pub fn height(&self) -> f32 {
        self.media_box[3] - self.media_box[1]
    }
}

/// Everything a content interpreter needs for one page.
pub struct PageJob<'a> {
    pub page: &'a ParsedPage,
    pub grid: &'a OccupancyGrid,
    pub translator: &'a dyn Translator,
    pub fonts: &'a FontAssetManager,
    pub lang_in: &'a str,
    pub lang_out: &'a str,
}

/// Rewrites a page's content stream. The document is only borrowed; all
/// changes go through the patch set.
pub trait ContentInterpreter: Send + Sync {
    fn process_page(
        &self,
        doc: &Document,
        job: &PageJob<'_>,
        patches: &mut PatchSet,
    ) -> anyhow::Result<()>;
}

/// Replacement stream contents keyed by object id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchSet {
    patches: BTreeMap<ObjectId, Vec<u8>>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the new contents of a stream. A later patch for the same
    /// object replaces the earlier one.
    pub fn insert(&mut self, id: ObjectId, content: Vec<u8>) {
        self.patches.insert(id, content);
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.patches.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&[u8]> {
        self.patches.get(&id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Write every patch into its stream object.
    pub fn apply(self, doc: &mut Document) -> Result<usize> {
        let count = self.patches.len();
        for (id, content) in self.patches {
            doc.get_object_mut(id)?.as_stream_mut()?.set_plain_content(content);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: TranslateError,
    }

    impl Translator for Flaky {
        fn translate(
            &self,
            text: &str,
            _lang_in: &str,
            _lang_out: &str,
        ) -> std::result::Result<String, TranslateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(text.to_uppercase())
            }
        }

        fn service_id(&self) -> &str {
            "flaky"
        }
    }

    fn flaky(failures: usize, error: TranslateError) -> Flaky {
        Flaky {
            calls: AtomicUsize::new(0),
            failures,
            error,
        }
    }

    #[test]
    fn cache_hits_skip_the_service() {
        let translator = CachedTranslator::new(flaky(0, TranslateError::Fatal(String::new())));
        assert_eq!(translator.translate("hello", "en", "fr").unwrap(), "HELLO");
        assert_eq!(translator.translate("hello", "en", "fr").unwrap(), "HELLO");
        assert_eq!(translator.inner().calls.load(Ordering::SeqCst), 1);
        // A different language pair is a different key.
        translator.translate("hello", "en", "de").unwrap();
        assert_eq!(translator.cached_entries(), 2);
    }

    #[test]
    fn ignore_cache_still_stores() {
        let translator =
            CachedTranslator::new(flaky(0, TranslateError::Fatal(String::new()))).ignore_cache(true);
        translator.translate("a", "en", "fr").unwrap();
        translator.translate("a", "en", "fr").unwrap();
        assert_eq!(translator.inner().calls.load(Ordering::SeqCst), 2);
        assert_eq!(translator.cached_entries(), 1);
    }

    #[test]
    fn retryable_errors_are_retried() {
        let translator =
            CachedTranslator::new(flaky(2, TranslateError::Retryable("timeout".into())))
                .max_retries(2);
        assert_eq!(translator.translate("x", "en", "fr").unwrap(), "X");
        assert_eq!(translator.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let translator =
            CachedTranslator::new(flaky(5, TranslateError::Retryable("busy".into())))
                .max_retries(1);
        assert!(translator.translate("x", "en", "fr").unwrap_err().is_retryable());
        assert_eq!(translator.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let translator = CachedTranslator::new(flaky(1, TranslateError::Fatal("auth".into())));
        assert_eq!(
            translator.translate("x", "en", "fr"),
            Err(TranslateError::Fatal("auth".into()))
        );
        assert_eq!(translator.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(translator.cached_entries(), 0);
    }

    #[test]
    fn whole_page_detector_covers_image() {
        let image = RgbImage::new(40, 30);
        let boxes = WholePageDetector.detect(&image).unwrap();
        assert_eq!(boxes, vec![LayoutBox::new("text", 0.0, 0.0, 40.0, 30.0)]);
    }

    #[test]
    fn rasterizer_scales_page_box() {
        use lopdf::dictionary;
        let mut doc = Document::with_version("1.5");
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 100.into(), 50.into()],
        });
        let image = MediaBoxRasterizer::new(2.0).render(&doc, page_id).unwrap();
        assert_eq!(image.dimensions(), (200, 100));
        let image = MediaBoxRasterizer::default().render(&doc, page_id).unwrap();
        assert_eq!(image.dimensions(), (100, 50));
    }
}
