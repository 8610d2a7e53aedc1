//! Page-tree plumbing: inherited attributes, single-page extraction, page
//! replacement and final serialization.

use crate::error::{Error, Result};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

/// Attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

const LETTER: [f32; 4] = [0.0, 0.0, 612.0, 792.0];

/// Page object ids in document order.
pub fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

pub fn page_id(doc: &Document, index: u32) -> Result<ObjectId> {
    doc.get_pages()
        .get(&(index + 1))
        .copied()
        .ok_or(Error::PageNotFound(index))
}

/// Resolve a dictionary that may be stored inline or behind a reference.
pub fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        _ => None,
    }
}

/// Look up `key` on the page, walking up `/Parent` links when absent.
pub fn inherited_attribute(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    // Depth limit guards against cyclic parent chains in malformed files.
    for _ in 0..32 {
        if let Ok(value) = current.get(key) {
            return Some(value.clone());
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// A rectangle attribute of the page, normalized to `[x0, y0, x1, y1]`.
fn page_rect(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<[f32; 4]> {
    let array = match inherited_attribute(doc, page_id, key)? {
        Object::Array(array) => array,
        Object::Reference(id) => doc.get_object(id).ok()?.as_array().ok()?.clone(),
        _ => return None,
    };
    let values: Vec<f32> = array.iter().filter_map(|o| o.as_float().ok()).collect();
    if values.len() != 4 {
        return None;
    }
    Some([
        values[0].min(values[2]),
        values[1].min(values[3]),
        values[0].max(values[2]),
        values[1].max(values[3]),
    ])
}

/// The page's MediaBox, falling back to US Letter.
pub fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    page_rect(doc, page_id, b"MediaBox").unwrap_or(LETTER)
}

/// The visible region: CropBox clipped to the MediaBox, or the MediaBox
/// when the page has no usable CropBox.
pub fn crop_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let media = media_box(doc, page_id);
    let Some(crop) = page_rect(doc, page_id, b"CropBox") else {
        return media;
    };
    let clipped = [
        crop[0].max(media[0]),
        crop[1].max(media[1]),
        crop[2].min(media[2]),
        crop[3].min(media[3]),
    ];
    if clipped[2] <= clipped[0] || clipped[3] <= clipped[1] {
        return media;
    }
    clipped
}

pub fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let [x0, y0, x1, y1] = media_box(doc, page_id);
    (x1 - x0, y1 - y0)
}

/// Copy inherited attributes onto the page so it can stand on its own.
pub fn materialize_inherited(doc: &mut Document, page_id: ObjectId) -> Result<()> {
    let mut found = Vec::new();
    for key in INHERITABLE {
        if !doc.get_dictionary(page_id)?.has(key) {
            if let Some(value) = inherited_attribute(doc, page_id, key) {
                found.push((key, value));
            }
        }
    }
    let page = doc.get_dictionary_mut(page_id)?;
    for (key, value) in found {
        page.set(key, value);
    }
    Ok(())
}

/// The page's content streams, decoded and concatenated.
pub fn page_content(doc: &Document, page_id: ObjectId) -> Result<Vec<u8>> {
    let page = doc.get_dictionary(page_id)?;
    let mut ids = Vec::new();
    match page.get(b"Contents") {
        Ok(Object::Reference(id)) => match doc.get_object(*id)? {
            Object::Array(items) => ids.extend(items.iter().filter_map(|o| o.as_reference().ok())),
            _ => ids.push(*id),
        },
        Ok(Object::Array(items)) => ids.extend(items.iter().filter_map(|o| o.as_reference().ok())),
        _ => {}
    }

    let mut content = Vec::new();
    for id in ids {
        let stream = doc.get_object(id)?.as_stream()?;
        let bytes = stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone());
        content.extend_from_slice(&bytes);
        content.push(b'\n');
    }
    Ok(content)
}

fn collect_references(obj: &Object, out: &mut Vec<ObjectId>) {
    match obj {
        Object::Reference(id) => out.push(*id),
        Object::Array(items) => items.iter().for_each(|o| collect_references(o, out)),
        Object::Dictionary(dict) => dict.iter().for_each(|(_, o)| collect_references(o, out)),
        Object::Stream(stream) => stream.dict.iter().for_each(|(_, o)| collect_references(o, out)),
        _ => {}
    }
}

fn is_page_node(obj: &Object) -> bool {
    matches!(obj.type_name(), Ok("Page") | Ok("Pages"))
}

/// Copy one page and everything it references into a standalone document.
///
/// References to other pages (link destinations, `/P` back-pointers of other
/// pages) are not followed.
pub fn extract_page(doc: &Document, page_id: ObjectId) -> Result<Document> {
    let mut page = doc.get_dictionary(page_id)?.clone();
    for key in INHERITABLE {
        if !page.has(key) {
            if let Some(value) = inherited_attribute(doc, page_id, key) {
                page.set(key, value);
            }
        }
    }
    page.remove(b"Parent");

    let mut fragment = Document::with_version(doc.version.clone());
    fragment.objects = reachable_objects(doc, &Object::Dictionary(page.clone()));

    fragment.objects.insert(page_id, Object::Dictionary(page));
    fragment.max_id = fragment.objects.keys().map(|(n, _)| *n).max().unwrap_or(0);

    let pages_id = fragment.new_object_id();
    fragment
        .get_dictionary_mut(page_id)?
        .set("Parent", Object::Reference(pages_id));
    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Kids", Object::Array(vec![Object::Reference(page_id)]));
    pages.set("Count", Object::Integer(1));
    fragment.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = fragment.add_object(Object::Dictionary(catalog));
    fragment.trailer.set("Root", Object::Reference(catalog_id));

    Ok(fragment)
}

/// Every object reachable from `root`, not following page-tree nodes.
pub fn reachable_objects(doc: &Document, root: &Object) -> BTreeMap<ObjectId, Object> {
    let mut found = BTreeMap::new();
    let mut seen = BTreeSet::new();
    let mut pending = Vec::new();
    collect_references(root, &mut pending);

    while let Some(id) = pending.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Ok(object) = doc.get_object(id) else {
            continue;
        };
        if is_page_node(object) {
            continue;
        }
        collect_references(object, &mut pending);
        found.insert(id, object.clone());
    }
    found
}

/// Insert `objects` into `target` under fresh ids, rewriting references
/// between them. Returns the old-to-new id map.
pub fn copy_objects(
    target: &mut Document,
    objects: BTreeMap<ObjectId, Object>,
) -> BTreeMap<ObjectId, ObjectId> {
    let map: BTreeMap<ObjectId, ObjectId> = objects
        .keys()
        .map(|id| (*id, target.new_object_id()))
        .collect();
    for (id, mut object) in objects {
        retarget(&mut object, &map);
        if let Some(new_id) = map.get(&id) {
            target.objects.insert(*new_id, object);
        }
    }
    map
}

/// Split a fragment into its page ids and the objects worth importing:
/// everything except its catalog and page-tree nodes.
fn detach_pages(source: Document) -> (Vec<ObjectId>, BTreeMap<ObjectId, Object>) {
    let pages = page_ids(&source);
    let page_set: BTreeSet<ObjectId> = pages.iter().copied().collect();

    let objects = source
        .objects
        .into_iter()
        .filter(|(id, object)| {
            let structural = matches!(object.type_name(), Ok("Catalog") | Ok("Pages"));
            !structural || page_set.contains(id)
        })
        .collect();
    (pages, objects)
}

fn retarget(obj: &mut Object, map: &BTreeMap<ObjectId, ObjectId>) {
    match obj {
        Object::Reference(id) => {
            if let Some(new_id) = map.get(id) {
                *id = *new_id;
            }
        }
        Object::Array(items) => items.iter_mut().for_each(|o| retarget(o, map)),
        Object::Dictionary(dict) => dict.iter_mut().for_each(|(_, o)| retarget(o, map)),
        Object::Stream(stream) => stream.dict.iter_mut().for_each(|(_, o)| retarget(o, map)),
        _ => {}
    }
}

/// Replace pages of `target` with single-page fragments, keeping positions.
///
/// The fragments must come from one working document: objects they share
/// under the same id (installed fonts, shared resources) are imported once.
/// Each fragment's page takes the old page's slot in its parent's `/Kids`,
/// and references elsewhere in the document (outlines, links) follow it.
pub fn replace_pages(target: &mut Document, fragments: Vec<(u32, Document)>) -> Result<()> {
    let pages = target.get_pages();
    let mut objects = BTreeMap::new();
    let mut slots = Vec::with_capacity(fragments.len());

    for (index, fragment) in fragments {
        let old_id = *pages
            .get(&(index + 1))
            .ok_or(Error::PageNotFound(index))?;
        let (fragment_pages, fragment_objects) = detach_pages(fragment);
        let page = *fragment_pages
            .first()
            .ok_or(Error::PageNotFound(index))?;
        objects.extend(fragment_objects);
        slots.push((index, old_id, page));
    }

    let map = copy_objects(target, objects);
    let mut retargeted = BTreeMap::new();
    for (index, old_id, page) in slots {
        let new_id = *map.get(&page).ok_or(Error::PageNotFound(index))?;
        let parent_id = target
            .get_dictionary(old_id)?
            .get(b"Parent")?
            .as_reference()?;
        target
            .get_dictionary_mut(new_id)?
            .set("Parent", Object::Reference(parent_id));

        let kids = target.get_dictionary_mut(parent_id)?.get_mut(b"Kids")?;
        if let Object::Array(kids) = kids {
            for kid in kids.iter_mut() {
                if matches!(kid, Object::Reference(id) if *id == old_id) {
                    *kid = Object::Reference(new_id);
                }
            }
        }

        target.objects.remove(&old_id);
        retargeted.insert(old_id, new_id);
    }

    if !retargeted.is_empty() {
        for object in target.objects.values_mut() {
            retarget(object, &retargeted);
        }
        if let Ok(root) = target.trailer.get_mut(b"Root") {
            retarget(root, &retargeted);
        }
    }
    Ok(())
}

fn fingerprint(obj: &Object, hasher: &mut DefaultHasher) {
    std::mem::discriminant(obj).hash(hasher);
    match obj {
        Object::Boolean(v) => v.hash(hasher),
        Object::Integer(v) => v.hash(hasher),
        Object::Real(v) => v.to_bits().hash(hasher),
        Object::Name(v) | Object::String(v, _) => v.hash(hasher),
        Object::Reference(id) => id.hash(hasher),
        Object::Array(items) => items.iter().for_each(|o| fingerprint(o, hasher)),
        Object::Dictionary(dict) => fingerprint_dict(dict, hasher),
        Object::Stream(stream) => {
            fingerprint_dict(&stream.dict, hasher);
            stream.content.hash(hasher);
        }
        _ => {}
    }
}

fn fingerprint_dict(dict: &Dictionary, hasher: &mut DefaultHasher) {
    for (key, value) in dict.iter() {
        key.hash(hasher);
        fingerprint(value, hasher);
    }
}

fn same_object(a: &Object, b: &Object) -> bool {
    match (a, b) {
        (Object::Null, Object::Null) => true,
        (Object::Boolean(x), Object::Boolean(y)) => x == y,
        (Object::Integer(x), Object::Integer(y)) => x == y,
        (Object::Real(x), Object::Real(y)) => x.to_bits() == y.to_bits(),
        (Object::Name(x), Object::Name(y)) => x == y,
        (Object::String(x, fx), Object::String(y, fy)) => {
            x == y && std::mem::discriminant(fx) == std::mem::discriminant(fy)
        }
        (Object::Reference(x), Object::Reference(y)) => x == y,
        (Object::Array(x), Object::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| same_object(x, y))
        }
        (Object::Dictionary(x), Object::Dictionary(y)) => same_dict(x, y),
        (Object::Stream(x), Object::Stream(y)) => same_dict(&x.dict, &y.dict) && x.content == y.content,
        _ => false,
    }
}

fn same_dict(a: &Dictionary, b: &Dictionary) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && same_object(va, vb))
}

/// Merge objects with identical contents into the lowest-numbered copy,
/// repeating until no more merges happen. Page-tree nodes and the catalog
/// are never merged. Returns the number of objects removed.
pub fn deduplicate_objects(doc: &mut Document) -> usize {
    let mut removed = 0;
    loop {
        let mut buckets: HashMap<u64, Vec<ObjectId>> = HashMap::new();
        for (id, object) in &doc.objects {
            if is_page_node(object) || matches!(object.type_name(), Ok("Catalog")) {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            fingerprint(object, &mut hasher);
            buckets.entry(hasher.finish()).or_default().push(*id);
        }

        let mut merged = BTreeMap::new();
        for ids in buckets.values().filter(|ids| ids.len() > 1) {
            let mut kept: Vec<ObjectId> = Vec::new();
            for id in ids {
                let object = &doc.objects[id];
                match kept.iter().find(|k| same_object(&doc.objects[*k], object)) {
                    Some(keep) => {
                        merged.insert(*id, *keep);
                    }
                    None => kept.push(*id),
                }
            }
        }
        if merged.is_empty() {
            return removed;
        }

        for id in merged.keys() {
            doc.objects.remove(id);
        }
        for object in doc.objects.values_mut() {
            retarget(object, &merged);
        }
        for (_, value) in doc.trailer.iter_mut() {
            retarget(value, &merged);
        }
        removed += merged.len();
    }
}

/// Merge duplicate objects, garbage-collect, renumber, compress and write
/// the document.
pub fn serialize(doc: &mut Document) -> Result<Vec<u8>> {
    let merged = deduplicate_objects(doc);
    if merged > 0 {
        log::debug!("Merged {} duplicate objects", merged);
    }
    doc.prune_objects();
    doc.renumber_objects();
    doc.compress();
    let mut output = Vec::new();
    doc.save_to(&mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};

    /// Two pages whose MediaBox and Resources live on the Pages node.
    fn inherited_doc() -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let mut kids = Vec::new();
        for text in ["first", "second"] {
            let content = format!("BT /F1 12 Tf 10 10 Td ({text}) Tj ET");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 300.into(), 400.into()],
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    #[test]
    fn media_box_is_inherited() {
        let doc = inherited_doc();
        let first = page_ids(&doc)[0];
        assert_eq!(media_box(&doc, first), [0.0, 0.0, 300.0, 400.0]);
        assert_eq!(page_size(&doc, first), (300.0, 400.0));
    }

    #[test]
    fn extracted_page_stands_alone() {
        let doc = inherited_doc();
        let second = page_ids(&doc)[1];
        let fragment = extract_page(&doc, second).unwrap();

        assert_eq!(fragment.get_pages().len(), 1);
        let page = fragment.get_dictionary(second).unwrap();
        assert!(page.has(b"MediaBox"));
        assert!(page.has(b"Resources"));
        let content = page_content(&fragment, second).unwrap();
        assert!(String::from_utf8_lossy(&content).contains("(second)"));
        // The sibling page was not dragged along.
        assert!(fragment.get_object(page_ids(&doc)[0]).is_err());
    }

    #[test]
    fn replacing_keeps_order_and_count() {
        let mut target = inherited_doc();
        let mut donor = inherited_doc();
        let donor_first = page_ids(&donor)[0];
        let content_id = donor
            .get_dictionary(donor_first)
            .unwrap()
            .get(b"Contents")
            .unwrap()
            .as_reference()
            .unwrap();
        donor
            .get_object_mut(content_id)
            .unwrap()
            .as_stream_mut()
            .unwrap()
            .set_plain_content(b"BT /F1 12 Tf 10 10 Td (replaced) Tj ET".to_vec());
        let fragment = extract_page(&donor, donor_first).unwrap();

        replace_pages(&mut target, vec![(1, fragment)]).unwrap();

        let ids = page_ids(&target);
        assert_eq!(ids.len(), 2);
        let first = String::from_utf8_lossy(&page_content(&target, ids[0]).unwrap()).to_string();
        let second = String::from_utf8_lossy(&page_content(&target, ids[1]).unwrap()).to_string();
        assert!(first.contains("(first)"));
        assert!(second.contains("(replaced)"));

        let bytes = serialize(&mut target).unwrap();
        let reloaded = Document::load_mem(&bytes).unwrap();
        assert_eq!(reloaded.get_pages().len(), 2);
    }

    #[test]
    fn crop_box_is_clipped_to_media_box() {
        let mut doc = inherited_doc();
        let first = page_ids(&doc)[0];
        assert_eq!(crop_box(&doc, first), [0.0, 0.0, 300.0, 400.0]);

        doc.get_dictionary_mut(first)
            .unwrap()
            .set("CropBox", vec![50.into(), (-20).into(), 350.into(), 200.into()]);
        assert_eq!(crop_box(&doc, first), [50.0, 0.0, 300.0, 200.0]);
    }

    #[test]
    fn identical_object_chains_are_merged() {
        let mut doc = inherited_doc();
        let mut fonts = Vec::new();
        for _ in 0..3 {
            let program = doc.add_object(Stream::new(
                dictionary! { "Length1" => 4 },
                b"glyf".to_vec(),
            ));
            let descriptor = doc.add_object(dictionary! {
                "Type" => "FontDescriptor",
                "FontFile2" => program,
            });
            fonts.push(doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "TrueType",
                "FontDescriptor" => descriptor,
            }));
        }
        let holder = doc.add_object(dictionary! {
            "A" => fonts[0],
            "B" => fonts[1],
            "C" => fonts[2],
        });

        // Two programs, two descriptors and two fonts go away.
        assert_eq!(deduplicate_objects(&mut doc), 6);
        let holder = doc.get_dictionary(holder).unwrap();
        let kept: BTreeSet<ObjectId> = [b"A", b"B", b"C"]
            .iter()
            .map(|key| holder.get(*key).unwrap().as_reference().unwrap())
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(page_ids(&doc).len(), 2);
    }

    #[test]
    fn fragments_of_one_document_share_imports() {
        let mut target = inherited_doc();
        let donor = inherited_doc();
        let fragments: Vec<(u32, Document)> = page_ids(&donor)
            .into_iter()
            .enumerate()
            .map(|(i, id)| (i as u32, extract_page(&donor, id).unwrap()))
            .collect();
        let before = target.objects.len();

        replace_pages(&mut target, fragments).unwrap();

        // Two pages, two content streams and one copy of the shared font
        // come in; the two old pages go.
        assert_eq!(target.objects.len(), before + 3);
        assert_eq!(page_ids(&target).len(), 2);
    }
}
