//! Font assets for translated text
//!
//! Resolves the embeddable font for the target language, installs it (plus
//! the Times-Roman fallback) into working documents, binds it into every font
//! resource dictionary, and shrinks the embedded program to the glyphs that
//! were actually shown.

use crate::error::{Error, FontError, Result};
use crate::page_tree;
use anyhow::{anyhow, Context};
use flate2::{write::ZlibEncoder, Compression};
use fontdue::{Font, FontSettings};
use lopdf::{content::Content, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Logical name of the always-present fallback asset (standard Times-Roman).
pub const FALLBACK_FONT: &str = "tiro";
/// Logical name of the language-specific asset.
pub const LANGUAGE_FONT: &str = "noto";

/// Universal font covering every non-CJK script.
const GO_NOTO: &str = "GoNotoKurrent-Regular.ttf";

/// Source of embeddable font files, keyed by language code.
pub trait FontProvider: Send + Sync {
    fn font_path(&self, lang: &str) -> anyhow::Result<PathBuf>;
}

impl<F> FontProvider for F
where
    F: Fn(&str) -> anyhow::Result<PathBuf> + Send + Sync,
{
    fn font_path(&self, lang: &str) -> anyhow::Result<PathBuf> {
        self(lang)
    }
}

/// Font file name used for a target language.
pub fn font_file_name(lang: &str) -> String {
    let lang = lang.to_ascii_lowercase();
    let region = match lang.as_str() {
        "zh-cn" | "zh-hans" | "zh" => Some("CN"),
        "zh-tw" | "zh-hant" => Some("TW"),
        "ja" => Some("JP"),
        "ko" => Some("KR"),
        _ => None,
    };
    match region {
        Some(region) => format!("SourceHanSerif{region}-Regular.ttf"),
        None => GO_NOTO.to_string(),
    }
}

/// Looks for the language font in a configured directory, then in the usual
/// system locations.
#[derive(Debug, Clone, Default)]
pub struct LocalFontProvider {
    font_dir: Option<PathBuf>,
}

impl LocalFontProvider {
    pub fn new(font_dir: Option<PathBuf>) -> Self {
        Self { font_dir }
    }

    fn candidates(&self, file_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(dir) = &self.font_dir {
            paths.push(dir.join(file_name));
        }
        // Container images ship the font next to the application.
        paths.push(Path::new("/app").join(file_name));
        for dir in [
            "/usr/share/fonts/truetype/noto",
            "/usr/share/fonts/opentype/noto",
            "/usr/local/share/fonts",
            "C:\\Windows\\Fonts",
        ] {
            paths.push(Path::new(dir).join(file_name));
        }
        paths
    }
}

impl FontProvider for LocalFontProvider {
    fn font_path(&self, lang: &str) -> anyhow::Result<PathBuf> {
        let file_name = font_file_name(lang);
        for path in self.candidates(&file_name) {
            if path.exists() {
                log::info!("Using font {} for language {}", path.display(), lang);
                return Ok(path);
            }
        }
        Err(anyhow!(
            "no font file {} found for language {}",
            file_name,
            lang
        ))
    }
}

/// A logical font name and, for embedded fonts, the file it comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct FontAsset {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outlines {
    TrueType,
    Cff,
}

/// The parsed language font and its raw program.
struct LanguageFont {
    font: Font,
    data: Arc<Vec<u8>>,
    pdf_name: String,
    outlines: Outlines,
    glyph_chars: HashMap<u16, char>,
}

/// Font object ids installed into one document, by logical name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstalledFonts {
    ids: BTreeMap<String, ObjectId>,
}

impl InstalledFonts {
    pub fn get(&self, name: &str) -> Option<ObjectId> {
        self.ids.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.ids.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

/// Summary of one subsetting pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubsetReport {
    pub fonts: usize,
    pub glyphs: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Where an object keeps its font resource dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FontSlot {
    /// Inline under `/Font` of the given container object.
    Direct(ObjectId),
    /// `/Font` points at a separate dictionary object.
    Indirect(ObjectId),
    Absent,
}

pub struct FontAssetManager {
    lang_out: String,
    assets: Vec<FontAsset>,
    language: LanguageFont,
}

impl FontAssetManager {
    /// Resolve the fallback and language assets. Any failure is fatal.
    pub fn new(lang_out: &str, provider: &dyn FontProvider) -> Result<Self> {
        let lang_out = lang_out.to_ascii_lowercase();
        let path = provider
            .font_path(&lang_out)
            .map_err(Error::FontResolution)?;
        let language = load_language_font(&path).map_err(Error::FontResolution)?;
        log::info!(
            "Loaded font {} ({:?}, {} glyphs) for {}",
            language.pdf_name,
            language.outlines,
            language.font.glyph_count(),
            lang_out
        );

        Ok(Self {
            lang_out,
            assets: vec![
                FontAsset {
                    name: FALLBACK_FONT.to_string(),
                    path: None,
                },
                FontAsset {
                    name: LANGUAGE_FONT.to_string(),
                    path: Some(path),
                },
            ],
            language,
        })
    }

    pub fn lang_out(&self) -> &str {
        &self.lang_out
    }

    pub fn assets(&self) -> &[FontAsset] {
        &self.assets
    }

    /// The parsed language font, for glyph lookup and metrics.
    pub fn language_font(&self) -> &Font {
        &self.language.font
    }

    /// Glyph id for `ch` in the language font, `None` when it has no glyph.
    pub fn glyph_id(&self, ch: char) -> Option<u16> {
        match self.language.font.lookup_glyph_index(ch) {
            0 => None,
            gid => Some(gid),
        }
    }

    /// Advance width of a glyph at `size`, in text space units.
    pub fn advance(&self, gid: u16, size: f32) -> f32 {
        self.language.font.metrics_indexed(gid, size).advance_width
    }

    /// Add every asset to the document and register it in each page's own
    /// font resources.
    pub fn install(&self, doc: &mut Document) -> Result<InstalledFonts> {
        let mut installed = InstalledFonts::default();
        for asset in &self.assets {
            let id = match asset.path {
                None => self.add_fallback_font(doc),
                Some(_) => self.add_language_font(doc)?,
            };
            installed.ids.insert(asset.name.clone(), id);
        }

        for page_id in page_tree::page_ids(doc) {
            page_tree::materialize_inherited(doc, page_id)?;
            let font_dict = page_font_dict(doc, page_id)?;
            for (name, id) in installed.iter() {
                font_dict.set(name, Object::Reference(id));
            }
        }
        Ok(installed)
    }

    /// Bind missing asset names into every font resource dictionary found in
    /// the document. Objects that cannot be interpreted are skipped.
    pub fn bind_resources(&self, doc: &mut Document, installed: &InstalledFonts) -> usize {
        let mut slots = BTreeSet::new();
        let ids: Vec<ObjectId> = doc.objects.keys().copied().collect();
        for id in ids {
            let Some(container) = container_dict(doc, id) else {
                continue;
            };
            if let Ok(resources) = container.get(b"Resources") {
                match resources {
                    Object::Dictionary(_) => {
                        if let Some(slot) = nested_font_slot(doc, id) {
                            slots.insert(slot);
                        }
                    }
                    Object::Reference(res_id) => {
                        slots.insert(font_slot(doc, *res_id));
                    }
                    _ => {}
                }
            }
            slots.insert(font_slot(doc, id));
        }

        let mut bound = 0;
        for slot in slots {
            let dict = match slot {
                FontSlot::Direct(owner) => direct_font_dict_mut(doc, owner),
                FontSlot::Indirect(font_id) => doc
                    .get_object_mut(font_id)
                    .ok()
                    .and_then(|o| o.as_dict_mut().ok()),
                FontSlot::Absent => None,
            };
            let Some(dict) = dict else {
                continue;
            };
            for (name, font_id) in installed.iter() {
                if !dict.has(name.as_bytes()) {
                    dict.set(name, Object::Reference(font_id));
                    bound += 1;
                }
            }
        }
        log::debug!("Bound {} font resource entries", bound);
        bound
    }

    /// Write `/W` widths and a `/ToUnicode` map for the language-font glyphs
    /// shown in the document. Returns the number of font objects updated.
    pub fn embed_glyph_metrics(&self, doc: &mut Document) -> std::result::Result<usize, FontError> {
        let usage = self.glyph_usage(doc)?;
        let mut updated = 0;
        for (font_id, glyphs) in usage {
            if glyphs.is_empty() {
                continue;
            }
            let Some(descendant_id) = descendant_font(doc, font_id) else {
                continue;
            };
            let widths = self.widths_array(&glyphs);
            if let Ok(cid_font) = doc.get_dictionary_mut(descendant_id) {
                cid_font.set("W", Object::Array(widths));
            }

            let cmap_id = doc.add_object(Stream::new(Dictionary::new(), self.to_unicode_cmap(&glyphs)));
            if let Ok(type0) = doc.get_dictionary_mut(font_id) {
                type0.set("ToUnicode", Object::Reference(cmap_id));
            }
            updated += 1;
        }
        Ok(updated)
    }

    /// Reduce every embedded copy of the language font to its used glyphs.
    /// Glyph ids are preserved, so content streams stay valid. A copy that
    /// cannot be subset is logged and keeps its full program.
    pub fn subset(&self, doc: &mut Document) -> std::result::Result<SubsetReport, FontError> {
        let usage = self.glyph_usage(doc)?;
        let mut report = SubsetReport::default();

        for (font_id, mut glyphs) in usage {
            if glyphs.is_empty() {
                continue;
            }
            glyphs.insert(0);
            let glyph_list: Vec<u16> = glyphs.into_iter().collect();
            match self.subset_copy(doc, font_id, &glyph_list) {
                Ok((before, after)) => {
                    report.fonts += 1;
                    report.glyphs += glyph_list.len();
                    report.bytes_before += before;
                    report.bytes_after += after;
                }
                Err(e) => log::warn!("Keeping full program of font {:?}: {}", font_id, e),
            }
        }

        log::info!(
            "Subset {} font program(s), {} -> {} bytes",
            report.fonts,
            report.bytes_before,
            report.bytes_after
        );
        Ok(report)
    }

    /// Subset one Type0 copy. Returns the program sizes before and after.
    fn subset_copy(
        &self,
        doc: &mut Document,
        font_id: ObjectId,
        glyph_list: &[u16],
    ) -> std::result::Result<(usize, usize), FontError> {
        let missing = || FontError::MissingProgram {
            name: self.language.pdf_name.clone(),
        };
        let descriptor_id = descendant_font(doc, font_id)
            .and_then(|cid| doc.get_dictionary(cid).ok()?.get(b"FontDescriptor").ok()?.as_reference().ok())
            .ok_or_else(missing)?;
        let (program_key, program_id) = font_program(doc, descriptor_id).ok_or_else(missing)?;

        let original = {
            let stream = doc.get_object(program_id)?.as_stream()?;
            if stream.dict.has(b"Filter") {
                stream.decompressed_content()?
            } else {
                stream.content.clone()
            }
        };
        let subset = subsetter::subset(&original, 0, subsetter::Profile::pdf(glyph_list))
            .map_err(|e| FontError::Subset {
                name: self.language.pdf_name.clone(),
                message: e.to_string(),
            })?;

        let mut dict = Dictionary::new();
        if program_key == b"FontFile2".as_slice() {
            dict.set("Length1", Object::Integer(subset.len() as i64));
        } else {
            dict.set("Subtype", Object::Name(b"OpenType".to_vec()));
        }
        dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        doc.objects
            .insert(program_id, Object::Stream(Stream::new(dict, deflate(&subset)?)));

        let tagged = format!("{}+{}", subset_tag(glyph_list), self.language.pdf_name);
        for id in [font_id, descriptor_id] {
            rename_font(doc, id, &tagged);
        }
        if let Some(cid) = descendant_font(doc, font_id) {
            rename_font(doc, cid, &tagged);
        }
        Ok((original.len(), subset.len()))
    }

    fn add_fallback_font(&self, doc: &mut Document) -> ObjectId {
        // Standard 14 font, nothing to embed.
        let mut font_dict = Dictionary::new();
        font_dict.set("Type", Object::Name(b"Font".to_vec()));
        font_dict.set("Subtype", Object::Name(b"Type1".to_vec()));
        font_dict.set("BaseFont", Object::Name(b"Times-Roman".to_vec()));
        font_dict.set("Encoding", Object::Name(b"WinAnsiEncoding".to_vec()));
        doc.add_object(Object::Dictionary(font_dict))
    }

    /// Composite Type0 font, Identity-H encoded, glyph ids used as CIDs.
    fn add_language_font(&self, doc: &mut Document) -> Result<ObjectId> {
        let base_font_name = self.language.pdf_name.clone();
        let line = self
            .language
            .font
            .horizontal_line_metrics(1000.0)
            .map(|m| (m.ascent, m.descent))
            .unwrap_or((880.0, -120.0));

        let mut font_descriptor = Dictionary::new();
        font_descriptor.set("Type", Object::Name(b"FontDescriptor".to_vec()));
        font_descriptor.set("FontName", Object::Name(base_font_name.clone().into_bytes()));
        font_descriptor.set("Flags", Object::Integer(4));
        font_descriptor.set(
            "FontBBox",
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(line.1.round() as i64),
                Object::Integer(1000),
                Object::Integer(line.0.round() as i64),
            ]),
        );
        font_descriptor.set("ItalicAngle", Object::Integer(0));
        font_descriptor.set("Ascent", Object::Integer(line.0.round() as i64));
        font_descriptor.set("Descent", Object::Integer(line.1.round() as i64));
        font_descriptor.set("CapHeight", Object::Integer(700));
        font_descriptor.set("StemV", Object::Integer(80));

        let mut program_dict = Dictionary::new();
        program_dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
        let (program_key, cid_subtype) = match self.language.outlines {
            Outlines::TrueType => {
                program_dict.set("Length1", Object::Integer(self.language.data.len() as i64));
                ("FontFile2", "CIDFontType2")
            }
            Outlines::Cff => {
                program_dict.set("Subtype", Object::Name(b"OpenType".to_vec()));
                ("FontFile3", "CIDFontType0")
            }
        };
        let program_id = doc.add_object(Stream::new(program_dict, deflate(&self.language.data)?));
        font_descriptor.set(program_key, Object::Reference(program_id));
        let font_descriptor_id = doc.add_object(Object::Dictionary(font_descriptor));

        let mut cidfont = Dictionary::new();
        cidfont.set("Type", Object::Name(b"Font".to_vec()));
        cidfont.set("Subtype", Object::Name(cid_subtype.as_bytes().to_vec()));
        cidfont.set("BaseFont", Object::Name(base_font_name.clone().into_bytes()));
        cidfont.set(
            "CIDSystemInfo",
            Object::Dictionary({
                let mut d = Dictionary::new();
                d.set("Registry", Object::string_literal("Adobe"));
                d.set("Ordering", Object::string_literal("Identity"));
                d.set("Supplement", Object::Integer(0));
                d
            }),
        );
        cidfont.set("FontDescriptor", Object::Reference(font_descriptor_id));
        cidfont.set("DW", Object::Integer(1000));
        if self.language.outlines == Outlines::TrueType {
            cidfont.set("CIDToGIDMap", Object::Name(b"Identity".to_vec()));
        }
        let cidfont_id = doc.add_object(Object::Dictionary(cidfont));

        let mut type0 = Dictionary::new();
        type0.set("Type", Object::Name(b"Font".to_vec()));
        type0.set("Subtype", Object::Name(b"Type0".to_vec()));
        type0.set("BaseFont", Object::Name(base_font_name.into_bytes()));
        type0.set("Encoding", Object::Name(b"Identity-H".to_vec()));
        type0.set("DescendantFonts", Object::Array(vec![Object::Reference(cidfont_id)]));
        Ok(doc.add_object(Object::Dictionary(type0)))
    }

    /// Copies of the language font in `doc`, by Type0 font object id.
    fn language_font_ids(&self, doc: &Document) -> BTreeSet<ObjectId> {
        doc.objects
            .iter()
            .filter_map(|(id, object)| {
                let dict = object.as_dict().ok()?;
                let subtype = dict.get(b"Subtype").ok()?.as_name().ok()?;
                let base = dict.get(b"BaseFont").ok()?.as_name().ok()?;
                (subtype == b"Type0" && strip_subset_tag(base) == self.language.pdf_name.as_bytes())
                    .then_some(*id)
            })
            .collect()
    }

    /// Glyph ids shown with each copy of the language font, across page
    /// contents and form XObjects.
    fn glyph_usage(
        &self,
        doc: &Document,
    ) -> std::result::Result<BTreeMap<ObjectId, BTreeSet<u16>>, FontError> {
        let targets = self.language_font_ids(doc);
        let mut usage: BTreeMap<ObjectId, BTreeSet<u16>> =
            targets.iter().map(|id| (*id, BTreeSet::new())).collect();
        if targets.is_empty() {
            return Ok(usage);
        }

        for page_id in page_tree::page_ids(doc) {
            let Ok(content) = page_tree::page_content(doc, page_id) else {
                continue;
            };
            let resources = page_tree::inherited_attribute(doc, page_id, b"Resources");
            let fonts = resource_fonts(doc, resources.as_ref());
            scan_glyphs(&content, &fonts, &targets, &mut usage);
        }

        for object in doc.objects.values() {
            let Object::Stream(stream) = object else {
                continue;
            };
            if !matches!(stream.dict.get(b"Subtype").and_then(|s| s.as_name()), Ok(b"Form")) {
                continue;
            }
            let content = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            let fonts = resource_fonts(doc, stream.dict.get(b"Resources").ok());
            scan_glyphs(&content, &fonts, &targets, &mut usage);
        }
        Ok(usage)
    }

    fn widths_array(&self, glyphs: &BTreeSet<u16>) -> Vec<Object> {
        let mut array = Vec::new();
        let mut run: Vec<Object> = Vec::new();
        let mut run_start = 0u16;
        let mut previous: Option<u16> = None;

        for &gid in glyphs {
            if previous.map_or(true, |p| p + 1 != gid) && !run.is_empty() {
                array.push(Object::Integer(i64::from(run_start)));
                array.push(Object::Array(std::mem::take(&mut run)));
            }
            if run.is_empty() {
                run_start = gid;
            }
            let width = self.language.font.metrics_indexed(gid, 1000.0).advance_width;
            run.push(Object::Integer(width.round() as i64));
            previous = Some(gid);
        }
        if !run.is_empty() {
            array.push(Object::Integer(i64::from(run_start)));
            array.push(Object::Array(run));
        }
        array
    }

    fn to_unicode_cmap(&self, glyphs: &BTreeSet<u16>) -> Vec<u8> {
        let mapped: Vec<(u16, char)> = glyphs
            .iter()
            .filter_map(|gid| self.language.glyph_chars.get(gid).map(|ch| (*gid, *ch)))
            .collect();

        let mut cmap = String::from(
            "/CIDInit /ProcSet findresource begin\n12 dict begin\nbegincmap\n\
             /CIDSystemInfo\n<< /Registry (Adobe)\n/Ordering (UCS)\n/Supplement 0\n>> def\n\
             /CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n\
             1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
        );
        for chunk in mapped.chunks(100) {
            cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
            for (gid, ch) in chunk {
                let mut units = [0u16; 2];
                let hex: String = ch
                    .encode_utf16(&mut units)
                    .iter()
                    .map(|u| format!("{u:04X}"))
                    .collect();
                cmap.push_str(&format!("<{gid:04X}> <{hex}>\n"));
            }
            cmap.push_str("endbfchar\n");
        }
        cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend");
        cmap.into_bytes()
    }
}

fn load_language_font(path: &Path) -> anyhow::Result<LanguageFont> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read font file {}", path.display()))?;
    let outlines = match data.get(0..4) {
        Some(b"OTTO") => Outlines::Cff,
        Some(b"ttcf") => {
            return Err(anyhow!(
                "{} is a font collection, which cannot be embedded",
                path.display()
            ))
        }
        Some(_) => Outlines::TrueType,
        None => return Err(anyhow!("{} is not a font file", path.display())),
    };
    let font = Font::from_bytes(data.as_slice(), FontSettings::default())
        .map_err(|e| anyhow!("failed to load font from {}: {}", path.display(), e))?;

    let mut glyph_chars = HashMap::new();
    for (ch, gid) in font.chars() {
        // Keep the lowest code point when several map to one glyph.
        glyph_chars
            .entry(gid.get())
            .and_modify(|existing: &mut char| {
                if *ch < *existing {
                    *existing = *ch;
                }
            })
            .or_insert(*ch);
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(LanguageFont {
        font,
        data: Arc::new(data),
        pdf_name: sanitize_pdf_font_name(&stem),
        outlines,
        glyph_chars,
    })
}

fn sanitize_pdf_font_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "NotoFont".to_string()
    } else {
        out
    }
}

fn strip_subset_tag(name: &[u8]) -> &[u8] {
    match name.get(6) {
        Some(b'+') if name[..6].iter().all(u8::is_ascii_uppercase) => &name[7..],
        _ => name,
    }
}

/// Deterministic six-letter tag derived from the glyph set.
fn subset_tag(glyphs: &[u16]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    glyphs.hash(&mut hasher);
    let mut h = hasher.finish();
    let mut tag = String::with_capacity(6);
    for _ in 0..6 {
        tag.push((b'A' + (h % 26) as u8) as char);
        h /= 26;
    }
    tag
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn rename_font(doc: &mut Document, id: ObjectId, name: &str) {
    if let Ok(dict) = doc.get_dictionary_mut(id) {
        let key: &[u8] = if dict.has(b"FontName") { b"FontName" } else { b"BaseFont" };
        dict.set(key, Object::Name(name.as_bytes().to_vec()));
    }
}

fn descendant_font(doc: &Document, type0_id: ObjectId) -> Option<ObjectId> {
    let dict = doc.get_dictionary(type0_id).ok()?;
    let descendants = match dict.get(b"DescendantFonts").ok()? {
        Object::Array(items) => items.clone(),
        Object::Reference(id) => doc.get_object(*id).ok()?.as_array().ok()?.clone(),
        _ => return None,
    };
    descendants.first()?.as_reference().ok()
}

fn font_program(doc: &Document, descriptor_id: ObjectId) -> Option<(&'static [u8], ObjectId)> {
    let descriptor = doc.get_dictionary(descriptor_id).ok()?;
    for key in [b"FontFile2".as_slice(), b"FontFile3".as_slice()] {
        if let Ok(id) = descriptor.get(key).and_then(|o| o.as_reference()) {
            return Some((key, id));
        }
    }
    None
}

/// Dictionary of an object, or of a stream object's dictionary.
fn container_dict(doc: &Document, id: ObjectId) -> Option<&Dictionary> {
    match doc.get_object(id).ok()? {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn container_dict_mut(doc: &mut Document, id: ObjectId) -> Option<&mut Dictionary> {
    match doc.get_object_mut(id).ok()? {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&mut stream.dict),
        _ => None,
    }
}

/// Classify the `/Font` entry of object `owner`.
fn font_slot(doc: &Document, owner: ObjectId) -> FontSlot {
    let Some(container) = container_dict(doc, owner) else {
        return FontSlot::Absent;
    };
    match container.get(b"Font") {
        Ok(Object::Dictionary(_)) => FontSlot::Direct(owner),
        Ok(Object::Reference(font_id)) => match doc.get_object(*font_id) {
            Ok(Object::Dictionary(_)) => FontSlot::Indirect(*font_id),
            _ => FontSlot::Absent,
        },
        _ => FontSlot::Absent,
    }
}

/// `/Resources/Font` of an object whose resources are inline. Inline font
/// dictionaries are addressed through a synthetic slot on the owner.
fn nested_font_slot(doc: &Document, owner: ObjectId) -> Option<FontSlot> {
    let resources = container_dict(doc, owner)?.get(b"Resources").ok()?.as_dict().ok()?;
    match resources.get(b"Font").ok()? {
        Object::Dictionary(_) => Some(FontSlot::Direct(owner)),
        Object::Reference(font_id) => doc
            .get_object(*font_id)
            .ok()?
            .as_dict()
            .ok()
            .map(|_| FontSlot::Indirect(*font_id)),
        _ => None,
    }
}

/// The inline font dictionary of `owner`, either `/Font` or
/// `/Resources/Font`.
fn direct_font_dict_mut(doc: &mut Document, owner: ObjectId) -> Option<&mut Dictionary> {
    let container = container_dict_mut(doc, owner)?;
    if matches!(container.get(b"Font"), Ok(Object::Dictionary(_))) {
        return container.get_mut(b"Font").ok()?.as_dict_mut().ok();
    }
    container
        .get_mut(b"Resources")
        .ok()?
        .as_dict_mut()
        .ok()?
        .get_mut(b"Font")
        .ok()?
        .as_dict_mut()
        .ok()
}

/// The page's font resource dictionary, created when missing. Resources
/// must already be materialized on the page.
fn page_font_dict(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary> {
    let font_ref = doc
        .get_dictionary(page_id)?
        .get(b"Resources")
        .ok()
        .and_then(|r| page_tree::resolve_dict(doc, r))
        .and_then(|r| r.get(b"Font").ok()?.as_reference().ok())
        .filter(|id| doc.get_dictionary(*id).is_ok());
    if let Some(id) = font_ref {
        return Ok(doc.get_dictionary_mut(id)?);
    }

    let resources = page_resources_mut(doc, page_id)?;
    if !matches!(resources.get(b"Font"), Ok(Object::Dictionary(_))) {
        resources.set("Font", Dictionary::new());
    }
    Ok(resources.get_mut(b"Font")?.as_dict_mut()?)
}

fn page_resources_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary> {
    let referenced = doc
        .get_dictionary(page_id)?
        .get(b"Resources")
        .and_then(Object::as_reference)
        .ok()
        .filter(|id| doc.get_dictionary(*id).is_ok());
    if let Some(id) = referenced {
        return Ok(doc.get_dictionary_mut(id)?);
    }

    let page = doc.get_dictionary_mut(page_id)?;
    if !matches!(page.get(b"Resources"), Ok(Object::Dictionary(_))) {
        page.set("Resources", Dictionary::new());
    }
    Ok(page.get_mut(b"Resources")?.as_dict_mut()?)
}

/// Resource name to font object id for a resources entry.
fn resource_fonts(doc: &Document, resources: Option<&Object>) -> HashMap<Vec<u8>, ObjectId> {
    let Some(resources) = resources.and_then(|r| page_tree::resolve_dict(doc, r)) else {
        return HashMap::new();
    };
    let Some(fonts) = resources
        .get(b"Font")
        .ok()
        .and_then(|f| page_tree::resolve_dict(doc, f))
    else {
        return HashMap::new();
    };
    fonts
        .iter()
        .filter_map(|(name, obj)| Some((name.clone(), obj.as_reference().ok()?)))
        .collect()
}

fn scan_glyphs(
    content: &[u8],
    fonts: &HashMap<Vec<u8>, ObjectId>,
    targets: &BTreeSet<ObjectId>,
    usage: &mut BTreeMap<ObjectId, BTreeSet<u16>>,
) {
    let Ok(content) = Content::decode(content) else {
        log::debug!("Skipping undecodable content stream while scanning glyphs");
        return;
    };
    let mut current: Option<ObjectId> = None;
    for op in &content.operations {
        match op.operator.as_str() {
            "Tf" => {
                current = op
                    .operands
                    .first()
                    .and_then(|o| o.as_name().ok())
                    .and_then(|name| fonts.get(name).copied())
                    .filter(|id| targets.contains(id));
            }
            "Tj" | "TJ" | "'" | "\"" => {
                let Some(font_id) = current else {
                    continue;
                };
                let glyphs = usage.entry(font_id).or_default();
                for operand in &op.operands {
                    collect_glyph_ids(operand, glyphs);
                }
            }
            _ => {}
        }
    }
}

fn collect_glyph_ids(operand: &Object, glyphs: &mut BTreeSet<u16>) {
    match operand {
        Object::String(bytes, _) => {
            for pair in bytes.chunks_exact(2) {
                glyphs.insert(u16::from_be_bytes([pair[0], pair[1]]));
            }
        }
        Object::Array(items) => items.iter().for_each(|item| collect_glyph_ids(item, glyphs)),
        _ => {}
    }
}

/// Encode glyph ids as an Identity-H hex string operand.
pub fn glyph_string(gids: &[u16]) -> Object {
    let bytes = gids.iter().flat_map(|g| g.to_be_bytes()).collect();
    Object::String(bytes, StringFormat::Hexadecimal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn font_file_names_follow_language() {
        assert_eq!(font_file_name("zh"), "SourceHanSerifCN-Regular.ttf");
        assert_eq!(font_file_name("zh-TW"), "SourceHanSerifTW-Regular.ttf");
        assert_eq!(font_file_name("ja"), "SourceHanSerifJP-Regular.ttf");
        assert_eq!(font_file_name("ko"), "SourceHanSerifKR-Regular.ttf");
        assert_eq!(font_file_name("ru"), GO_NOTO);
        assert_eq!(font_file_name("fr"), GO_NOTO);
    }

    #[test]
    fn provider_failure_is_fatal() {
        let provider = |_: &str| -> anyhow::Result<PathBuf> { Err(anyhow!("offline")) };
        let err = FontAssetManager::new("zh", &provider).err().unwrap();
        assert!(matches!(err, Error::FontResolution(_)));
    }

    #[test]
    fn unreadable_font_is_fatal() {
        let provider =
            |_: &str| -> anyhow::Result<PathBuf> { Ok(PathBuf::from("/nonexistent/font.ttf")) };
        assert!(FontAssetManager::new("zh", &provider).is_err());
    }

    #[test]
    fn sanitized_names() {
        assert_eq!(sanitize_pdf_font_name("Go Noto (Kurrent)"), "Go-Noto-Kurrent");
        assert_eq!(sanitize_pdf_font_name("***"), "NotoFont");
    }

    #[test]
    fn subset_tags() {
        let tag = subset_tag(&[0, 3, 9]);
        assert_eq!(tag.len(), 6);
        assert!(tag.bytes().all(|b| b.is_ascii_uppercase()));
        assert_eq!(tag, subset_tag(&[0, 3, 9]));
        let tagged = format!("{tag}+DejaVuSans");
        assert_eq!(strip_subset_tag(tagged.as_bytes()), b"DejaVuSans");
        assert_eq!(strip_subset_tag(b"DejaVuSans"), b"DejaVuSans");
    }

    #[test]
    fn glyph_ids_from_strings_and_arrays() {
        let mut glyphs = BTreeSet::new();
        collect_glyph_ids(&glyph_string(&[0x0041, 0x1234]), &mut glyphs);
        collect_glyph_ids(
            &Object::Array(vec![glyph_string(&[7]), Object::Integer(-120)]),
            &mut glyphs,
        );
        assert_eq!(glyphs, [7, 0x0041, 0x1234].into_iter().collect());
    }

    #[test]
    fn deflated_programs_inflate_back() {
        use std::io::Read;
        let data = b"glyf loca head hhea".repeat(50);
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(packed.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, data);
    }
}
