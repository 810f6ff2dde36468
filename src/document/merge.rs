//! Page-level PDF concatenation on top of `lopdf`.
//!
//! Source documents are renumbered into the output's id space, their page
//! dictionaries are re-parented under a single new page tree and their old
//! catalog/page-tree nodes are dropped. Attributes a page inherits from its
//! former tree (`Resources`, `MediaBox`, `CropBox`, `Rotate`) are copied onto
//! the page first so nothing is lost when the old tree goes away.

use lopdf::{Dictionary, Document, Object, ObjectId, dictionary};

use super::converter::{A4_HEIGHT_PT, A4_WIDTH_PT};
use super::error::ConversionError;

const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];
const MAX_TREE_DEPTH: usize = 32;

/// Accumulates pages from several documents, in append order.
pub struct PdfMerger {
    doc: Document,
    pages: Vec<ObjectId>,
}

impl Default for PdfMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfMerger {
    pub fn new() -> Self {
        Self {
            doc: Document::with_version("1.5"),
            pages: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Append every page of `source`, in its own page order. Returns the
    /// number of pages appended; nothing is added when an error is returned.
    pub fn append(&mut self, mut source: Document) -> Result<usize, ConversionError> {
        source.renumber_objects_with(self.doc.max_id + 1);

        let page_ids: Vec<ObjectId> = source.get_pages().into_values().collect();
        let mut pages = Vec::with_capacity(page_ids.len());
        for id in page_ids {
            let mut page = source
                .get_dictionary(id)
                .map_err(|e| ConversionError::Pdf(format!("page {id:?}: {e}")))?
                .clone();
            for key in INHERITABLE {
                if !page.has(key)
                    && let Some(value) = inherited(&source, &page, key)
                {
                    page.set(key.to_vec(), value);
                }
            }
            if !page.has(b"MediaBox") {
                page.set("MediaBox", a4_media_box());
            }
            pages.push((id, page));
        }

        self.doc.max_id = self.doc.max_id.max(source.max_id);
        for (id, object) in source.objects {
            if is_node(&object, b"Catalog") || is_node(&object, b"Pages") {
                continue;
            }
            self.doc.objects.insert(id, object);
        }

        let appended = pages.len();
        for (id, page) in pages {
            self.doc.objects.insert(id, Object::Dictionary(page));
            self.pages.push(id);
        }
        Ok(appended)
    }

    /// Build the page tree and serialize the merged document.
    pub fn finish(mut self) -> Result<Vec<u8>, String> {
        let pages_id = self.doc.new_object_id();
        for id in &self.pages {
            if let Ok(page) = self
                .doc
                .get_object_mut(*id)
                .and_then(Object::as_dict_mut)
            {
                page.set("Parent", pages_id);
            }
        }

        let kids: Vec<Object> = self.pages.iter().map(|id| Object::Reference(*id)).collect();
        let count = kids.len() as i64;
        self.doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();

        let mut out = Vec::new();
        self.doc.save_to(&mut out).map_err(|e| e.to_string())?;
        Ok(out)
    }
}

/// Wrap one page dictionary into a standalone single-page document.
pub(crate) fn single_page_document(mut doc: Document, mut page: Dictionary) -> Document {
    let pages_id = doc.new_object_id();
    page.set("Type", "Page");
    page.set("Parent", pages_id);
    let page_id = doc.add_object(page);
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

pub(crate) fn media_box(width: f32, height: f32) -> Vec<Object> {
    vec![0.into(), 0.into(), Object::Real(width), Object::Real(height)]
}

fn a4_media_box() -> Vec<Object> {
    media_box(A4_WIDTH_PT, A4_HEIGHT_PT)
}

fn is_node(object: &Object, type_name: &[u8]) -> bool {
    match object {
        Object::Dictionary(dict) => dict
            .get(b"Type")
            .and_then(Object::as_name)
            .is_ok_and(|name| name == type_name),
        _ => false,
    }
}

fn inherited(doc: &Document, page: &Dictionary, key: &[u8]) -> Option<Object> {
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    for _ in 0..MAX_TREE_DEPTH {
        let node = doc.get_dictionary(parent?).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::testing::{page_widths, sample_pdf};

    fn load(bytes: &[u8]) -> Document {
        Document::load_mem(bytes).unwrap()
    }

    #[test]
    fn pages_keep_append_order() {
        let mut merger = PdfMerger::new();
        assert_eq!(merger.append(load(&sample_pdf(2, 100))).unwrap(), 2);
        assert_eq!(merger.append(load(&sample_pdf(1, 200))).unwrap(), 1);
        assert_eq!(merger.append(load(&sample_pdf(3, 300))).unwrap(), 3);
        assert_eq!(merger.page_count(), 6);

        let bytes = merger.finish().unwrap();
        assert_eq!(
            page_widths(&bytes),
            vec![100.0, 100.0, 200.0, 300.0, 300.0, 300.0]
        );
    }

    #[test]
    fn inherited_media_box_survives() {
        // sample_pdf declares MediaBox on the page tree node, not on pages.
        let mut merger = PdfMerger::new();
        merger.append(load(&sample_pdf(1, 420))).unwrap();
        let merged = load(&merger.finish().unwrap());
        let (_, page_id) = merged.get_pages().into_iter().next().unwrap();
        assert!(merged.get_dictionary(page_id).unwrap().has(b"MediaBox"));
    }

    #[test]
    fn merged_output_has_single_page_tree() {
        let mut merger = PdfMerger::new();
        merger.append(load(&sample_pdf(1, 100))).unwrap();
        merger.append(load(&sample_pdf(1, 200))).unwrap();
        let merged = load(&merger.finish().unwrap());
        let trees = merged
            .objects
            .values()
            .filter(|o| is_node(o, b"Pages"))
            .count();
        assert_eq!(trees, 1);
        assert_eq!(merged.get_pages().len(), 2);
    }
}
