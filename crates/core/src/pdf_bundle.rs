//! Builds a single PDF out of selected pages of source PDFs.
//!
//! Every extracted page is wrapped as a Form XObject and drawn onto a fresh
//! page. All output pages share the size of the first extracted page; other
//! pages are stretched to fit. The source page's resources and content
//! streams are copied as-is, with object ids remapped into the new document.

use crate::extractor::SourceKind;
use crate::{BundleError, Passage};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const A4: [f32; 4] = [0.0, 0.0, 595.0, 842.0];
const FORM_NAME: &str = "Pg0";
const MAX_INHERITANCE_DEPTH: usize = 32;

/// Pages to extract, grouped by source in first-seen order. Page indices are
/// zero-based and ascending within a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSelection {
    sources: Vec<(PathBuf, BTreeSet<u32>)>,
}

impl PageSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: impl Into<PathBuf>, page_index: u32) {
        let source = source.into();
        match self.sources.iter_mut().find(|(path, _)| *path == source) {
            Some((_, pages)) => {
                pages.insert(page_index);
            }
            None => self.sources.push((source, BTreeSet::from([page_index]))),
        }
    }

    /// Pages behind the given passages. Passages from non-PDF sources have
    /// no page to copy and are left out.
    pub fn from_passages<'a>(passages: impl IntoIterator<Item = &'a Passage>) -> Self {
        let mut selection = Self::new();
        for passage in passages {
            if SourceKind::from_path(Path::new(&passage.source_path)) == Some(SourceKind::Pdf) {
                selection.add(&passage.source_path, passage.page_index);
            }
        }
        selection
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &BTreeSet<u32>)> {
        self.sources
            .iter()
            .map(|(path, pages)| (path.as_path(), pages))
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.sources.iter().map(|(_, pages)| pages.len()).sum()
    }
}

/// Extracts the selected pages into a new document. Sources that cannot be
/// opened and pages past the end of a source are logged and skipped.
pub fn extract_pages(selection: &PageSelection) -> Document {
    let mut target = Document::with_version("1.5");
    let pages_id = target.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    let mut target_size: Option<(f32, f32)> = None;

    for (path, pages) in selection.iter() {
        let source = match Document::load(path) {
            Ok(document) => document,
            Err(error) => {
                warn!(path = %path.display(), %error, "cannot open source pdf; skipping");
                continue;
            }
        };
        let page_ids = source.get_pages();
        let mut copier = ObjectCopier::new(&source);

        for page_index in pages {
            let page_number = page_index.checked_add(1);
            let Some(page_id) = page_number.and_then(|number| page_ids.get(&number)).copied() else {
                warn!(
                    path = %path.display(),
                    page = page_index,
                    available = page_ids.len(),
                    "page out of range; skipping"
                );
                continue;
            };

            let bbox = page_box(&source, page_id);
            let (width, height) =
                *target_size.get_or_insert((bbox[2] - bbox[0], bbox[3] - bbox[1]));

            let form_id = copier.copy_page_as_form(&mut target, page_id, bbox);
            let content_id = target.add_object(Stream::new(
                Dictionary::new(),
                placement(bbox, width, height).into_bytes(),
            ));
            let page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => real_array([0.0, 0.0, width, height]),
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => dictionary! { FORM_NAME => form_id },
                },
            };
            kids.push(target.add_object(page).into());
        }
    }

    let count = kids.len() as i64;
    target.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = target.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    target.trailer.set("Root", catalog_id);

    debug!(pages = count, "extracted pages");
    target
}

/// Saves through a partial file and a rename so readers never see a
/// half-written PDF.
pub fn write_pdf(document: &mut Document, path: &Path) -> Result<(), BundleError> {
    let partial = partial_path(path, 0);
    save_partial(document, &partial)?;
    fs::rename(&partial, path)?;
    Ok(())
}

fn save_partial(document: &mut Document, partial: &Path) -> Result<(), BundleError> {
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent)?;
    }
    document
        .save(partial)
        .map_err(|error| BundleError::Pdf(error.to_string()))?;
    Ok(())
}

fn partial_path(path: &Path, generation: u64) -> PathBuf {
    path.with_extension(format!("{generation}.partial"))
}

/// `cm` operator mapping the source box onto a `width` x `height` page.
fn placement(bbox: [f32; 4], width: f32, height: f32) -> String {
    let source_width = (bbox[2] - bbox[0]).max(f32::EPSILON);
    let source_height = (bbox[3] - bbox[1]).max(f32::EPSILON);
    let scale_x = width / source_width;
    let scale_y = height / source_height;
    let shift_x = -bbox[0] * scale_x;
    let shift_y = -bbox[1] * scale_y;
    format!("q {scale_x} 0 0 {scale_y} {shift_x} {shift_y} cm /{FORM_NAME} Do Q")
}

fn page_box(document: &Document, page_id: ObjectId) -> [f32; 4] {
    inherited(document, page_id, b"MediaBox")
        .and_then(|object| rectangle(document, &object))
        .or_else(|| {
            inherited(document, page_id, b"CropBox").and_then(|object| rectangle(document, &object))
        })
        .unwrap_or(A4)
}

/// Looks up a page attribute, walking up the page tree for inherited ones.
fn inherited(document: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut node_id = page_id;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        let node = document.get_dictionary(node_id).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(resolve(document, value).clone());
        }
        node_id = node.get(b"Parent").and_then(Object::as_reference).ok()?;
    }
    None
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> &'a Object {
    match object {
        Object::Reference(id) => document.get_object(*id).unwrap_or(object),
        other => other,
    }
}

fn real_array(values: [f32; 4]) -> Vec<Object> {
    values.iter().map(|value| Object::Real(*value)).collect()
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn rectangle(document: &Document, object: &Object) -> Option<[f32; 4]> {
    let values = object
        .as_array()
        .ok()?
        .iter()
        .map(|item| number(resolve(document, item)))
        .collect::<Option<Vec<_>>>()?;
    let [x0, y0, x1, y1] = <[f32; 4]>::try_from(values).ok()?;
    let rect = [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)];
    if rect[2] - rect[0] <= 0.0 || rect[3] - rect[1] <= 0.0 {
        return None;
    }
    Some(rect)
}

/// Deep-copies objects from one document into another, remapping ids. Each
/// source object is copied once per source document.
struct ObjectCopier<'a> {
    source: &'a Document,
    mapped: HashMap<ObjectId, ObjectId>,
}

impl<'a> ObjectCopier<'a> {
    fn new(source: &'a Document) -> Self {
        Self {
            source,
            mapped: HashMap::new(),
        }
    }

    fn copy_page_as_form(&mut self, target: &mut Document, page_id: ObjectId, bbox: [f32; 4]) -> ObjectId {
        let content = match self.source.get_page_content(page_id) {
            Ok(content) => content,
            Err(error) => {
                warn!(%error, "page content unreadable; page will be blank");
                Vec::new()
            }
        };
        let resources = match inherited(self.source, page_id, b"Resources") {
            Some(resources) => self.copy(target, &resources),
            None => Object::Dictionary(Dictionary::new()),
        };

        let form = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => real_array(bbox),
            "Resources" => resources,
        };
        target.add_object(Stream::new(form, content))
    }

    fn copy(&mut self, target: &mut Document, object: &Object) -> Object {
        match object {
            Object::Reference(id) => Object::Reference(self.copy_reference(target, *id)),
            Object::Array(items) => {
                Object::Array(items.iter().map(|item| self.copy(target, item)).collect())
            }
            Object::Dictionary(dictionary) => Object::Dictionary(self.copy_dictionary(target, dictionary)),
            Object::Stream(stream) => {
                let mut copied = stream.clone();
                copied.dict = self.copy_dictionary(target, &stream.dict);
                Object::Stream(copied)
            }
            other => other.clone(),
        }
    }

    fn copy_dictionary(&mut self, target: &mut Document, dictionary: &Dictionary) -> Dictionary {
        let mut copied = Dictionary::new();
        for (key, value) in dictionary.iter() {
            // back-references into the source page tree
            if key.as_slice() == b"Parent" {
                continue;
            }
            copied.set(key.clone(), self.copy(target, value));
        }
        copied
    }

    fn copy_reference(&mut self, target: &mut Document, id: ObjectId) -> ObjectId {
        if let Some(mapped) = self.mapped.get(&id) {
            return *mapped;
        }

        let new_id = target.new_object_id();
        self.mapped.insert(id, new_id);
        let copied = match self.source.get_object(id) {
            Ok(object) => self.copy(target, object),
            Err(_) => Object::Null,
        };
        target.objects.insert(new_id, copied);
        new_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    Written { pages: usize },
    /// A newer turn for the same session started before this one finished.
    Superseded,
}

/// Writes each session's result bundle to `<tmp_dir>/<session>_tmp_result.pdf`.
///
/// Every turn takes a generation ticket with [`BundleWriter::begin`]. A write
/// only lands if its ticket is still the newest for that session, so a slow
/// extraction never overwrites the bundle of a later turn.
#[derive(Debug)]
pub struct BundleWriter {
    tmp_dir: PathBuf,
    generations: Mutex<HashMap<String, u64>>,
}

impl BundleWriter {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn bundle_path(&self, session_id: &str) -> PathBuf {
        self.tmp_dir
            .join(format!("{}_tmp_result.pdf", bundle_file_stem(session_id)))
    }

    pub fn begin(&self, session_id: &str) -> u64 {
        let mut generations = self.generations.lock();
        let generation = generations.entry(session_id.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn is_current(&self, session_id: &str, ticket: u64) -> bool {
        self.generations.lock().get(session_id) == Some(&ticket)
    }

    pub fn write(
        &self,
        session_id: &str,
        ticket: u64,
        selection: &PageSelection,
    ) -> Result<BundleStatus, BundleError> {
        if !self.is_current(session_id, ticket) {
            return Ok(BundleStatus::Superseded);
        }

        let mut document = extract_pages(selection);
        let pages = document.get_pages().len();
        let path = self.bundle_path(session_id);
        let partial = partial_path(&path, ticket);
        save_partial(&mut document, &partial)?;

        // Checked again under the lock so a newer ticket cannot rename first
        // and then be overwritten by this one.
        let generations = self.generations.lock();
        if generations.get(session_id) != Some(&ticket) {
            drop(generations);
            if let Err(error) = fs::remove_file(&partial) {
                debug!(path = %partial.display(), %error, "could not remove stale bundle");
            }
            info!(session_id, ticket, "bundle superseded by a newer turn");
            return Ok(BundleStatus::Superseded);
        }
        fs::rename(&partial, &path)?;
        drop(generations);

        info!(session_id, pages, path = %path.display(), "bundle written");
        Ok(BundleStatus::Written { pages })
    }

    pub fn forget(&self, session_id: &str) {
        self.generations.lock().remove(session_id);
    }
}

/// File-name stem for a session. Ids made only of `[A-Za-z0-9_-]` are used
/// as-is; any other id becomes `~` plus the sha256 of its bytes, so distinct
/// ids never share a bundle.
fn bundle_file_stem(session_id: &str) -> String {
    let plain = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        return session_id.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    format!("~{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pdf(path: &Path, sizes: &[(f32, f32)]) {
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

        let mut kids: Vec<Object> = Vec::new();
        for (number, (width, height)) in sizes.iter().enumerate() {
            let content = format!("BT /F1 24 Tf 72 72 Td (Page {number}) Tj ET");
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => real_array([0.0, 0.0, *width, *height]),
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => sizes.len() as i64,
                "Resources" => resources_id,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
        page_box(doc, page_id)
    }

    fn form_content(doc: &Document, page_id: ObjectId) -> Vec<u8> {
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let form_id = xobjects.get(FORM_NAME.as_bytes()).unwrap().as_reference().unwrap();
        doc.get_object(form_id).unwrap().as_stream().unwrap().content.clone()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn empty_selection_has_no_pages() {
        let doc = extract_pages(&PageSelection::new());
        assert!(doc.get_pages().is_empty());
    }

    #[test]
    fn selected_pages_share_the_first_page_size() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0), (595.0, 842.0), (300.0, 400.0)]);

        let mut selection = PageSelection::new();
        selection.add(&source, 2);
        selection.add(&source, 0);
        let doc = extract_pages(&selection);

        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);
        for page_id in pages.values() {
            assert_eq!(media_box(&doc, *page_id), [0.0, 0.0, 612.0, 792.0]);
        }
        assert!(contains(&form_content(&doc, pages[&1]), b"(Page 0)"));
        assert!(contains(&form_content(&doc, pages[&2]), b"(Page 2)"));
    }

    #[test]
    fn sources_keep_first_seen_order() {
        let dir = tempdir().unwrap();
        let small = dir.path().join("small.pdf");
        let large = dir.path().join("large.pdf");
        make_pdf(&small, &[(300.0, 400.0)]);
        make_pdf(&large, &[(612.0, 792.0), (612.0, 792.0)]);

        let mut selection = PageSelection::new();
        selection.add(&small, 0);
        selection.add(&large, 1);
        let doc = extract_pages(&selection);

        let pages = doc.get_pages();
        assert_eq!(pages.len(), 2);
        assert_eq!(media_box(&doc, pages[&2]), [0.0, 0.0, 300.0, 400.0]);
        assert!(contains(&form_content(&doc, pages[&2]), b"(Page 1)"));
    }

    #[test]
    fn out_of_range_and_missing_sources_are_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0)]);

        let mut selection = PageSelection::new();
        selection.add(&source, 99);
        selection.add(dir.path().join("gone.pdf"), 0);
        let doc = extract_pages(&selection);
        assert!(doc.get_pages().is_empty());
    }

    #[test]
    fn stretch_placement_scales_axes_independently() {
        let operator = placement([0.0, 0.0, 300.0, 400.0], 600.0, 200.0);
        assert_eq!(operator, "q 2 0 0 0.5 -0 -0 cm /Pg0 Do Q");
    }

    #[test]
    fn selection_groups_passages_by_source() {
        let passage = |source: &str, page: u32| Passage {
            node_id: format!("{source}-{page}"),
            source_path: source.to_string(),
            page_index: page,
            chunk_index: 0,
            text: String::new(),
        };
        let passages = vec![
            passage("b.pdf", 3),
            passage("notes.txt", 0),
            passage("a.pdf", 1),
            passage("b.pdf", 0),
            passage("b.pdf", 3),
        ];
        let selection = PageSelection::from_passages(&passages);

        let grouped = selection
            .iter()
            .map(|(path, pages)| (path.to_path_buf(), pages.iter().copied().collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        assert_eq!(
            grouped,
            vec![
                (PathBuf::from("b.pdf"), vec![0, 3]),
                (PathBuf::from("a.pdf"), vec![1]),
            ]
        );
        assert_eq!(selection.page_count(), 3);
    }

    #[test]
    fn bundle_is_written_and_reloadable() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0), (612.0, 792.0), (612.0, 792.0)]);

        let writer = BundleWriter::new(dir.path().join("tmp"));
        let mut selection = PageSelection::new();
        selection.add(&source, 0);
        selection.add(&source, 2);

        let ticket = writer.begin("abc");
        let status = writer.write("abc", ticket, &selection).unwrap();
        assert_eq!(status, BundleStatus::Written { pages: 2 });

        let path = writer.bundle_path("abc");
        assert!(path.ends_with("abc_tmp_result.pdf"));
        let reloaded = Document::load(&path).unwrap();
        assert_eq!(reloaded.get_pages().len(), 2);
    }

    #[test]
    fn stale_generation_does_not_overwrite() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0), (612.0, 792.0)]);

        let writer = BundleWriter::new(dir.path());
        let stale = writer.begin("s");
        let fresh = writer.begin("s");

        let mut newer = PageSelection::new();
        newer.add(&source, 1);
        assert_eq!(
            writer.write("s", fresh, &newer).unwrap(),
            BundleStatus::Written { pages: 1 }
        );

        let mut older = PageSelection::new();
        older.add(&source, 0);
        older.add(&source, 1);
        assert_eq!(writer.write("s", stale, &older).unwrap(), BundleStatus::Superseded);

        let reloaded = Document::load(writer.bundle_path("s")).unwrap();
        assert_eq!(reloaded.get_pages().len(), 1);
    }

    #[test]
    fn empty_selection_still_replaces_the_bundle() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0)]);

        let writer = BundleWriter::new(dir.path());
        let mut selection = PageSelection::new();
        selection.add(&source, 0);
        let first = writer.begin("s");
        writer.write("s", first, &selection).unwrap();

        let second = writer.begin("s");
        let status = writer.write("s", second, &PageSelection::new()).unwrap();
        assert_eq!(status, BundleStatus::Written { pages: 0 });
        let reloaded = Document::load(writer.bundle_path("s")).unwrap();
        assert!(reloaded.get_pages().is_empty());
    }

    #[test]
    fn distinct_session_ids_get_distinct_bundles() {
        let writer = BundleWriter::new("/tmp/bundles");
        assert_ne!(writer.bundle_path("a.b"), writer.bundle_path("a_b"));
        assert_ne!(writer.bundle_path(""), writer.bundle_path("session"));
        assert!(writer.bundle_path("a-b_c1").ends_with("a-b_c1_tmp_result.pdf"));

        let stem = bundle_file_stem("../etc");
        assert!(stem.starts_with('~'));
        assert!(!stem.contains('/') && !stem.contains('.'));
    }

    #[test]
    fn largest_page_index_is_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("manual.pdf");
        make_pdf(&source, &[(612.0, 792.0)]);

        let mut selection = PageSelection::new();
        selection.add(&source, u32::MAX);
        assert!(extract_pages(&selection).get_pages().is_empty());
    }
}
