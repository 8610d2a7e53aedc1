//! Side-by-side document: original page on the left, translation on the
//! right, each drawn unscaled from a Form XObject.

use crate::error::Result;
use crate::fonts::FontAssetManager;
use crate::page_tree;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::BTreeMap;

/// A source page imported as a Form XObject.
#[derive(Debug, Clone, Copy)]
struct WrappedPage {
    form: ObjectId,
    width: f32,
    height: f32,
}

/// Import every page of `source` into `out` as a Form XObject clipped to
/// its visible region. Objects shared between pages are imported once.
fn wrap_pages(out: &mut Document, source: &Document) -> Result<Vec<WrappedPage>> {
    let mut objects = BTreeMap::new();
    let mut placeholders = Vec::new();
    let mut next_id = source.max_id;

    for page_id in page_tree::page_ids(source) {
        let visible = page_tree::crop_box(source, page_id);
        let content = page_tree::page_content(source, page_id)?;
        let resources = page_tree::inherited_attribute(source, page_id, b"Resources")
            .unwrap_or_else(|| Object::Dictionary(Dictionary::new()));
        objects.extend(page_tree::reachable_objects(source, &resources));

        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"XObject".to_vec()));
        dict.set("Subtype", Object::Name(b"Form".to_vec()));
        dict.set(
            "BBox",
            Object::Array(visible.iter().map(|v| Object::Real(*v)).collect()),
        );
        dict.set(
            "Matrix",
            Object::Array(vec![
                1.into(),
                0.into(),
                0.into(),
                1.into(),
                Object::Real(-visible[0]),
                Object::Real(-visible[1]),
            ]),
        );
        dict.set("Resources", resources);

        next_id += 1;
        let placeholder = (next_id, 0);
        objects.insert(placeholder, Object::Stream(Stream::new(dict, content)));
        placeholders.push((
            placeholder,
            visible[2] - visible[0],
            visible[3] - visible[1],
        ));
    }

    let map = page_tree::copy_objects(out, objects);
    Ok(placeholders
        .into_iter()
        .filter_map(|(placeholder, width, height)| {
            Some(WrappedPage {
                form: *map.get(&placeholder)?,
                width,
                height,
            })
        })
        .collect())
}

fn place(name: &str, x: f32, y: f32) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![1.into(), 0.into(), 0.into(), 1.into(), x.into(), y.into()],
        ),
        Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ]
}

pub struct DualDocumentSynthesizer<'a> {
    fonts: Option<&'a FontAssetManager>,
}

impl<'a> DualDocumentSynthesizer<'a> {
    /// With `fonts`, embedded language fonts of the result are subset.
    pub fn new(fonts: Option<&'a FontAssetManager>) -> Self {
        Self { fonts }
    }

    /// Build the dual document: page `i` is `original[i]` at `x = 0` next to
    /// `translated[i]` at `x = w_o`, both aligned to the top edge.
    pub fn synthesize(&self, original: &Document, translated: &Document) -> Result<Document> {
        let mut out = Document::with_version(original.version.clone());
        let pages_id = out.new_object_id();

        let left = wrap_pages(&mut out, original)?;
        let right = wrap_pages(&mut out, translated)?;
        if left.len() != right.len() {
            log::warn!(
                "Original has {} pages, translation {}; dual keeps {}",
                left.len(),
                right.len(),
                left.len().min(right.len())
            );
        }

        let mut kids = Vec::new();
        for (l, r) in left.iter().zip(&right) {
            let width = l.width + r.width;
            let height = l.height.max(r.height);

            let mut operations = place("SrcL", 0.0, height - l.height);
            operations.extend(place("SrcR", l.width, height - r.height));
            let content = Content { operations }.encode()?;
            let content_id = out.add_object(Stream::new(Dictionary::new(), content));

            let mut xobjects = Dictionary::new();
            xobjects.set("SrcL", Object::Reference(l.form));
            xobjects.set("SrcR", Object::Reference(r.form));
            let mut resources = Dictionary::new();
            resources.set("XObject", Object::Dictionary(xobjects));

            let mut page = Dictionary::new();
            page.set("Type", Object::Name(b"Page".to_vec()));
            page.set("Parent", Object::Reference(pages_id));
            page.set(
                "MediaBox",
                Object::Array(vec![0.into(), 0.into(), Object::Real(width), Object::Real(height)]),
            );
            page.set("Resources", Object::Dictionary(resources));
            page.set("Contents", Object::Reference(content_id));
            kids.push(Object::Reference(out.add_object(Object::Dictionary(page))));
        }

        let mut pages = Dictionary::new();
        pages.set("Type", Object::Name(b"Pages".to_vec()));
        pages.set("Count", Object::Integer(kids.len() as i64));
        pages.set("Kids", Object::Array(kids));
        out.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = Dictionary::new();
        catalog.set("Type", Object::Name(b"Catalog".to_vec()));
        catalog.set("Pages", Object::Reference(pages_id));
        let catalog_id = out.add_object(Object::Dictionary(catalog));
        out.trailer.set("Root", Object::Reference(catalog_id));

        if let Some(fonts) = self.fonts {
            if let Err(e) = fonts.subset(&mut out) {
                log::warn!("Keeping full fonts in dual document: {}", e);
            }
        }
        log::debug!("Dual document synthesized with {} pages", out.get_pages().len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn document(sizes: &[(i64, i64)], text: &str) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids = Vec::new();
        for (i, (w, h)) in sizes.iter().enumerate() {
            let content = format!("BT /F1 12 Tf 10 10 Td ({text} {i}) Tj ET");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), (*w).into(), (*h).into()],
                "Resources" => resources_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => sizes.len() as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    #[test]
    fn dual_page_is_wide_and_tall_enough() {
        let original = document(&[(300, 400), (200, 100)], "source");
        let translated = document(&[(250, 500), (200, 100)], "target");
        let dual = DualDocumentSynthesizer::new(None)
            .synthesize(&original, &translated)
            .unwrap();

        let ids = page_tree::page_ids(&dual);
        assert_eq!(ids.len(), 2);
        assert_eq!(page_tree::media_box(&dual, ids[0]), [0.0, 0.0, 550.0, 500.0]);
        assert_eq!(page_tree::media_box(&dual, ids[1]), [0.0, 0.0, 400.0, 100.0]);
    }

    #[test]
    fn sides_are_top_aligned() {
        let original = document(&[(300, 400)], "source");
        let translated = document(&[(250, 500)], "target");
        let dual = DualDocumentSynthesizer::new(None)
            .synthesize(&original, &translated)
            .unwrap();
        let page = page_tree::page_ids(&dual)[0];
        let content = page_tree::page_content(&dual, page).unwrap();
        let ops = Content::decode(&content).unwrap().operations;
        let offsets: Vec<(f32, f32)> = ops
            .iter()
            .filter(|op| op.operator == "cm")
            .map(|op| {
                (
                    op.operands[4].as_float().unwrap(),
                    op.operands[5].as_float().unwrap(),
                )
            })
            .collect();
        assert_eq!(offsets, vec![(0.0, 100.0), (300.0, 0.0)]);
    }

    #[test]
    fn shared_resources_are_imported_once() {
        let original = document(&[(100, 100), (100, 100), (100, 100)], "source");
        let translated = document(&[(100, 100), (100, 100), (100, 100)], "target");
        let dual = DualDocumentSynthesizer::new(None)
            .synthesize(&original, &translated)
            .unwrap();
        let fonts = dual
            .objects
            .values()
            .filter(|o| matches!(o.type_name(), Ok("Font")))
            .count();
        assert_eq!(fonts, 2);

        let forms: Vec<&Stream> = dual
            .objects
            .values()
            .filter_map(|o| o.as_stream().ok())
            .filter(|s| s.dict.has(b"BBox"))
            .collect();
        assert_eq!(forms.len(), 6);
        let text: Vec<String> = forms
            .iter()
            .map(|s| String::from_utf8_lossy(&s.content).into_owned())
            .collect();
        assert!(text.iter().any(|t| t.contains("(source 2)")));
        assert!(text.iter().any(|t| t.contains("(target 0)")));
    }

    #[test]
    fn crop_box_sizes_the_dual_page() {
        let mut original = document(&[(612, 792)], "source");
        let mut translated = document(&[(612, 792)], "target");
        for doc in [&mut original, &mut translated] {
            let page = page_tree::page_ids(doc)[0];
            doc.get_dictionary_mut(page).unwrap().set(
                "CropBox",
                vec![100.into(), 100.into(), 400.into(), 500.into()],
            );
        }
        let dual = DualDocumentSynthesizer::new(None)
            .synthesize(&original, &translated)
            .unwrap();

        let page = page_tree::page_ids(&dual)[0];
        assert_eq!(page_tree::media_box(&dual, page), [0.0, 0.0, 600.0, 400.0]);
        let form = dual
            .objects
            .values()
            .filter_map(|o| o.as_stream().ok())
            .find(|s| s.dict.has(b"BBox"))
            .unwrap();
        let bbox: Vec<f32> = form
            .dict
            .get(b"BBox")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_float().unwrap())
            .collect();
        assert_eq!(bbox, vec![100.0, 100.0, 400.0, 500.0]);
    }

    #[test]
    fn shorter_document_bounds_the_page_count() {
        let original = document(&[(100, 100), (100, 100), (100, 100)], "source");
        let translated = document(&[(100, 100), (100, 100)], "target");
        let dual = DualDocumentSynthesizer::new(None)
            .synthesize(&original, &translated)
            .unwrap();
        assert_eq!(page_tree::page_ids(&dual).len(), 2);
    }
}
