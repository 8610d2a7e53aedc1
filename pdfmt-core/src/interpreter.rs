//! Default content interpreter: lifts text out of detected text blocks,
//! translates it per block and typesets the result with the language font.

use crate::collaborators::{ContentInterpreter, PageJob, PatchSet};
use crate::fonts::{glyph_string, FontAssetManager, LANGUAGE_FONT};
use crate::layout::{OccupancyGrid, FIRST_BLOCK_ID};
use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, StringFormat};
use rayon::prelude::*;
use std::collections::BTreeMap;

type Matrix = [f32; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
const DEFAULT_FONT_SIZE: f32 = 10.0;
const MIN_FONT_SIZE: f32 = 4.0;

/// Line spacing relative to font size for a target language.
pub fn line_height(lang_out: &str) -> f32 {
    match lang_out.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" | "zh-tw" | "zh-hans" | "zh-hant" => 1.4,
        "ko" | "en" => 1.2,
        "ar" => 1.0,
        "ru" | "uk" | "ta" => 0.8,
        _ => 1.1,
    }
}

fn multiply(l: &Matrix, r: &Matrix) -> Matrix {
    [
        l[0] * r[0] + l[1] * r[2],
        l[0] * r[1] + l[1] * r[3],
        l[2] * r[0] + l[3] * r[2],
        l[2] * r[1] + l[3] * r[3],
        l[4] * r[0] + l[5] * r[2] + r[4],
        l[4] * r[1] + l[5] * r[3] + r[5],
    ]
}

fn translation(tx: f32, ty: f32) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, tx, ty]
}

fn numbers(operands: &[Object]) -> Vec<f32> {
    operands.iter().filter_map(|o| o.as_float().ok()).collect()
}

/// Text state carried across operators.
#[derive(Debug, Clone)]
struct TextState {
    ctm: Matrix,
    stack: Vec<Matrix>,
    tm: Matrix,
    tlm: Matrix,
    leading: f32,
    font_size: f32,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            ctm: IDENTITY,
            stack: Vec::new(),
            tm: IDENTITY,
            tlm: IDENTITY,
            leading: 0.0,
            font_size: DEFAULT_FONT_SIZE,
        }
    }
}

impl TextState {
    fn next_line(&mut self, tx: f32, ty: f32) {
        self.tlm = multiply(&translation(tx, ty), &self.tlm);
        self.tm = self.tlm;
    }

    /// Current text origin in user space.
    fn origin(&self) -> (f32, f32) {
        let m = multiply(&self.tm, &self.ctm);
        (m[4], m[5])
    }

    /// Font size after text and graphics scaling.
    fn effective_size(&self) -> f32 {
        let m = multiply(&self.tm, &self.ctm);
        let scale = m[2].hypot(m[3]);
        if scale > 0.0 {
            self.font_size * scale
        } else {
            self.font_size
        }
    }

    /// Update state for a non-showing operator.
    fn apply(&mut self, op: &Operation) {
        let n = numbers(&op.operands);
        match op.operator.as_str() {
            "q" => self.stack.push(self.ctm),
            "Q" => {
                if let Some(ctm) = self.stack.pop() {
                    self.ctm = ctm;
                }
            }
            "cm" if n.len() == 6 => {
                let m = [n[0], n[1], n[2], n[3], n[4], n[5]];
                self.ctm = multiply(&m, &self.ctm);
            }
            "BT" => {
                self.tm = IDENTITY;
                self.tlm = IDENTITY;
            }
            "Tf" => {
                if let Some(size) = n.first() {
                    self.font_size = size.abs();
                }
            }
            "TL" if n.len() == 1 => self.leading = n[0],
            "Td" if n.len() == 2 => self.next_line(n[0], n[1]),
            "TD" if n.len() == 2 => {
                self.leading = -n[1];
                self.next_line(n[0], n[1]);
            }
            "T*" => self.next_line(0.0, -self.leading),
            "Tm" if n.len() == 6 => {
                self.tlm = [n[0], n[1], n[2], n[3], n[4], n[5]];
                self.tm = self.tlm;
            }
            _ => {}
        }
    }
}

fn is_show_operator(operator: &str) -> bool {
    matches!(operator, "Tj" | "TJ" | "'" | "\"")
}

/// Text of a showing operator when every string is plain printable ASCII.
fn plain_text(op: &Operation) -> Option<String> {
    let mut text = String::new();
    let strings: &[Object] = match op.operator.as_str() {
        "\"" => op.operands.get(2..).unwrap_or(&[]),
        _ => &op.operands,
    };
    for operand in strings {
        match operand {
            Object::String(bytes, StringFormat::Literal) => text.push_str(ascii(bytes)?.as_str()),
            Object::Array(items) => {
                for item in items {
                    match item {
                        Object::String(bytes, StringFormat::Literal) => {
                            text.push_str(ascii(bytes)?.as_str())
                        }
                        Object::String(_, _) => return None,
                        // Large negative adjustments separate words.
                        other => {
                            if other.as_float().map_or(false, |kern| kern < -200.0) {
                                text.push(' ');
                            }
                        }
                    }
                }
            }
            Object::String(_, _) => return None,
            _ => {}
        }
    }
    Some(text)
}

fn ascii(bytes: &[u8]) -> Option<String> {
    bytes
        .iter()
        .all(|b| (0x20..=0x7e).contains(b) || b.is_ascii_whitespace())
        .then(|| String::from_utf8_lossy(bytes).into_owned())
}

#[derive(Debug, Default)]
struct Block {
    text: String,
    font_size: Option<f32>,
    last_y: Option<f32>,
}

impl Block {
    fn push(&mut self, piece: &str, y: f32, size: f32) {
        let new_line = self.last_y.map_or(false, |last| (last - y).abs() > size * 0.5);
        if new_line
            && !self.text.ends_with(char::is_whitespace)
            && !piece.starts_with(char::is_whitespace)
        {
            self.text.push(' ');
        }
        self.text.push_str(piece);
        self.font_size.get_or_insert(size);
        self.last_y = Some(y);
    }
}

/// Page-space rectangle `(x0, y0, x1, y1)` covered by a block's cells.
fn block_rect(grid: &OccupancyGrid, id: u32, media_box: &[f32; 4]) -> Option<[f32; 4]> {
    let (c0, r0, c1, r1) = grid.block_bounds(id)?;
    let sx = (media_box[2] - media_box[0]) / grid.width() as f32;
    let sy = (media_box[3] - media_box[1]) / grid.height() as f32;
    Some([
        media_box[0] + c0 as f32 * sx,
        media_box[1] + r0 as f32 * sy,
        media_box[0] + (c1 + 1) as f32 * sx,
        media_box[1] + (r1 + 1) as f32 * sy,
    ])
}

/// Greedy line breaking on glyph advances. Words wider than a line are
/// broken between characters. Characters without a glyph are dropped.
fn wrap(fonts: &FontAssetManager, text: &str, size: f32, max_width: f32) -> Vec<Vec<u16>> {
    let mut lines: Vec<Vec<u16>> = Vec::new();
    let mut line: Vec<u16> = Vec::new();
    let mut line_width = 0.0;

    for word in text.split_inclusive(char::is_whitespace) {
        let glyphs: Vec<(u16, f32)> = word
            .chars()
            .map(|ch| if ch.is_whitespace() { ' ' } else { ch })
            .filter_map(|ch| fonts.glyph_id(ch).map(|gid| (gid, fonts.advance(gid, size))))
            .collect();
        let word_width: f32 = glyphs.iter().map(|(_, w)| w).sum();

        if line_width + word_width > max_width && !line.is_empty() && word_width <= max_width {
            lines.push(std::mem::take(&mut line));
            line_width = 0.0;
        }
        for (gid, width) in glyphs {
            if line_width + width > max_width && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
                line_width = 0.0;
            }
            line.push(gid);
            line_width += width;
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

/// Typeset `text` into `rect`, shrinking the font until it fits.
fn typeset(
    fonts: &FontAssetManager,
    text: &str,
    rect: [f32; 4],
    size: f32,
    line_height: f32,
) -> Vec<Operation> {
    let width = (rect[2] - rect[0]).max(1.0);
    let height = (rect[3] - rect[1]).max(1.0);
    let mut size = size.max(MIN_FONT_SIZE);
    let mut lines = wrap(fonts, text, size, width);
    while lines.len() as f32 * size * line_height > height && size > MIN_FONT_SIZE {
        size = (size * 0.9).max(MIN_FONT_SIZE);
        lines = wrap(fonts, text, size, width);
    }

    let mut ops = vec![
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(LANGUAGE_FONT.as_bytes().to_vec()), size.into()],
        ),
    ];
    let mut y = rect[3] - size;
    for line in lines.iter().filter(|line| !line.is_empty()) {
        ops.push(Operation::new(
            "Tm",
            vec![1.into(), 0.into(), 0.into(), 1.into(), rect[0].into(), y.into()],
        ));
        ops.push(Operation::new("Tj", vec![glyph_string(line)]));
        y -= size * line_height;
    }
    ops.push(Operation::new("ET", vec![]));
    ops
}

/// Replaces text inside detected text blocks with its translation.
///
/// Showing operators whose origin falls in a text block and whose strings are
/// plain ASCII are removed and their text is grouped per block. Everything
/// else, including all text in protected and background cells, is kept as is.
pub struct BlockTextInterpreter {
    pool: rayon::ThreadPool,
}

impl BlockTextInterpreter {
    /// `threads == 0` uses rayon's default pool size.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .context("failed to build translation thread pool")?;
        Ok(Self { pool })
    }
}

impl ContentInterpreter for BlockTextInterpreter {
    fn process_page(&self, _doc: &Document, job: &PageJob<'_>, patches: &mut PatchSet) -> Result<()> {
        let page = job.page;
        let content = Content::decode(&page.content)
            .with_context(|| format!("cannot decode content stream of page {}", page.index))?;
        let (page_w, page_h) = (page.width(), page.height());

        let mut state = TextState::default();
        let mut kept = Vec::with_capacity(content.operations.len() + 2);
        let mut blocks: BTreeMap<u32, Block> = BTreeMap::new();
        kept.push(Operation::new("q", vec![]));

        for op in content.operations {
            if !is_show_operator(&op.operator) {
                state.apply(&op);
                kept.push(op);
                continue;
            }
            if op.operator == "'" || op.operator == "\"" {
                state.next_line(0.0, -state.leading);
            }

            let (x, y) = state.origin();
            let cell = job.grid.at_point(
                x - page.media_box[0],
                y - page.media_box[1],
                page_w,
                page_h,
            );
            let text = (cell >= FIRST_BLOCK_ID).then(|| plain_text(&op)).flatten();
            match text {
                Some(text) => {
                    let size = state.effective_size();
                    blocks.entry(cell).or_default().push(&text, y, size);
                    // The line move of ' and " must survive the removal.
                    if op.operator != "Tj" && op.operator != "TJ" {
                        kept.push(Operation::new("T*", vec![]));
                    }
                }
                None => kept.push(op),
            }
        }
        kept.push(Operation::new("Q", vec![]));

        let pending: Vec<(u32, Block)> = blocks
            .into_iter()
            .filter(|(_, block)| !block.text.trim().is_empty())
            .collect();
        let translated: Vec<String> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|(id, block)| {
                    let source = block.text.trim();
                    match job.translator.translate(source, job.lang_in, job.lang_out) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!(
                                "Keeping source text of block {} on page {}: {}",
                                id,
                                page.index,
                                e
                            );
                            source.to_string()
                        }
                    }
                })
                .collect()
        });

        let spacing = line_height(job.lang_out);
        for ((id, block), text) in pending.iter().zip(translated) {
            let Some(rect) = block_rect(job.grid, *id, &page.media_box) else {
                continue;
            };
            let size = block.font_size.unwrap_or(DEFAULT_FONT_SIZE);
            kept.extend(typeset(job.fonts, &text, rect, size, spacing));
        }

        log::debug!(
            "Page {}: {} text blocks translated",
            page.index,
            pending.len()
        );
        let bytes = Content { operations: kept }
            .encode()
            .context("cannot encode rewritten content stream")?;
        patches.insert(page.content_id, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(operator: &str, operands: Vec<Object>) -> Operation {
        Operation::new(operator, operands)
    }

    #[test]
    fn text_origin_follows_ctm_and_td() {
        let mut state = TextState::default();
        state.apply(&op("cm", vec![2.into(), 0.into(), 0.into(), 2.into(), 10.into(), 20.into()]));
        state.apply(&op("BT", vec![]));
        state.apply(&op("Td", vec![5.into(), 5.into()]));
        assert_eq!(state.origin(), (20.0, 30.0));
        state.apply(&op("Tf", vec![Object::Name(b"F1".to_vec()), 12.into()]));
        assert_eq!(state.effective_size(), 24.0);
    }

    #[test]
    fn leading_moves_to_next_line() {
        let mut state = TextState::default();
        state.apply(&op("BT", vec![]));
        state.apply(&op("TD", vec![0.into(), (-14).into()]));
        state.apply(&op("T*", vec![]));
        assert_eq!(state.origin(), (0.0, -28.0));
    }

    #[test]
    fn q_restores_ctm() {
        let mut state = TextState::default();
        state.apply(&op("q", vec![]));
        state.apply(&op("cm", vec![1.into(), 0.into(), 0.into(), 1.into(), 50.into(), 0.into()]));
        state.apply(&op("Q", vec![]));
        assert_eq!(state.ctm, IDENTITY);
    }

    #[test]
    fn only_plain_literal_strings_are_lifted() {
        let literal = op("Tj", vec![Object::string_literal("Hello")]);
        assert_eq!(plain_text(&literal).as_deref(), Some("Hello"));

        let hex = op("Tj", vec![Object::String(vec![0, 42], StringFormat::Hexadecimal)]);
        assert_eq!(plain_text(&hex), None);

        let binary = op("Tj", vec![Object::String(vec![0xe4, 0xb8], StringFormat::Literal)]);
        assert_eq!(plain_text(&binary), None);

        let array = op(
            "TJ",
            vec![Object::Array(vec![
                Object::string_literal("Hel"),
                Object::Integer(-20),
                Object::string_literal("lo"),
                Object::Integer(-300),
                Object::string_literal("world"),
            ])],
        );
        assert_eq!(plain_text(&array).as_deref(), Some("Hello world"));
    }

    #[test]
    fn block_joins_lines_with_spaces() {
        let mut block = Block::default();
        block.push("first", 700.0, 10.0);
        block.push(" part", 700.0, 10.0);
        block.push("second", 688.0, 10.0);
        assert_eq!(block.text, "first part second");
        assert_eq!(block.font_size, Some(10.0));
    }

    #[test]
    fn block_rect_maps_cells_to_page_space() {
        use crate::layout::{LayoutAnalyzer, LayoutBox};
        // 100x100 px image of a 200x200 pt page.
        let grid = LayoutAnalyzer::default()
            .analyze(100, 100, &[LayoutBox::new("text", 10.0, 10.0, 20.0, 20.0)]);
        // cols 9..21, rows 79..91
        let rect = block_rect(&grid, 2, &[0.0, 0.0, 200.0, 200.0]).unwrap();
        assert_eq!(rect, [18.0, 158.0, 42.0, 182.0]);
    }

    #[test]
    fn line_heights() {
        assert_eq!(line_height("zh-CN"), 1.4);
        assert_eq!(line_height("ja"), 1.1);
        assert_eq!(line_height("ru"), 0.8);
    }
}
