//! On-disk semantic index over document pages.
//!
//! The index lives in `persist_dir` as two JSON files. `index_store.json` is
//! the manifest. Its presence marks a built index, and it records the
//! embedding model, the per-source page counters and the file checksums.
//! `docstore.json` holds every passage with its vector.
//!
//! Writes are serialized by a single async mutex. Each write clones the
//! current snapshot, applies the change, persists it, and only then swaps the
//! shared `Arc`. Readers clone that `Arc` and never wait on a writer, so a
//! retrieval always runs against the last persisted state.

use crate::chunking::{split_page, ChunkingConfig};
use crate::embeddings::cosine_similarity;
use crate::extractor::PageReader;
use crate::ingest::{discover_source_files, load_source, IngestionReport, LoadedSource, SkippedFile};
use crate::traits::Embedder;
use crate::{DocumentPage, IndexError, IngestError, PageInput, Passage, ScoredPassage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const MARKER_FILE: &str = "index_store.json";
pub const DOCSTORE_FILE: &str = "docstore.json";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    pub embedding_model: String,
    pub dimensions: usize,
    /// Next page index per source. Restored on load so pages inserted after a
    /// restart never reuse an index.
    pub page_counters: BTreeMap<String, u32>,
    pub checksums: BTreeMap<String, String>,
    pub node_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    passage: Passage,
    vector: Vec<f32>,
}

#[derive(Serialize)]
struct DocStoreRef<'a> {
    nodes: &'a [StoredNode],
}

#[derive(Deserialize)]
struct DocStore {
    nodes: Vec<StoredNode>,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    manifest: IndexManifest,
    nodes: Vec<StoredNode>,
}

impl IndexSnapshot {
    fn empty(embedding_model: String) -> Self {
        let now = Utc::now();
        Self {
            manifest: IndexManifest {
                version: FORMAT_VERSION,
                embedding_model,
                dimensions: 0,
                page_counters: BTreeMap::new(),
                checksums: BTreeMap::new(),
                node_count: 0,
                created_at: now,
                updated_at: now,
            },
            nodes: Vec::new(),
        }
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn passages(&self) -> impl Iterator<Item = &Passage> {
        self.nodes.iter().map(|node| &node.passage)
    }

    pub fn page_count(&self, source_path: &str) -> u32 {
        self.manifest
            .page_counters
            .get(source_path)
            .copied()
            .unwrap_or(0)
    }

    fn record_dimensions(&mut self, dimensions: usize) -> Result<(), IndexError> {
        if self.manifest.dimensions == 0 {
            self.manifest.dimensions = dimensions;
        } else if self.manifest.dimensions != dimensions {
            return Err(IndexError::Incompatible(format!(
                "embedding dimension changed from {} to {}",
                self.manifest.dimensions, dimensions
            )));
        }
        Ok(())
    }

    fn remove_source(&mut self, source_path: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.passage.source_path != source_path);
        let had_counter = self.manifest.page_counters.remove(source_path).is_some();
        self.manifest.checksums.remove(source_path);
        had_counter || before != self.nodes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Indexed { pages: usize, passages: usize },
    Replaced { pages: usize, passages: usize },
    Unchanged,
}

pub struct OpenedIndex {
    pub store: IndexStore,
    /// Present only when the index was built from the data directory.
    pub report: Option<IngestionReport>,
}

pub struct IndexStore {
    persist_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    reader: Arc<dyn PageReader>,
    chunking: ChunkingConfig,
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl IndexStore {
    pub async fn load_or_create(
        data_dir: &Path,
        persist_dir: &Path,
        embedder: Arc<dyn Embedder>,
        reader: Arc<dyn PageReader>,
        chunking: ChunkingConfig,
    ) -> Result<OpenedIndex, IndexError> {
        chunking.validate()?;

        if tokio::fs::try_exists(persist_dir.join(MARKER_FILE)).await? {
            info!(path = %persist_dir.display(), "loading index from storage");
            let snapshot = load_snapshot(persist_dir).await?;
            let configured = embedder.model_name();
            if snapshot.manifest.embedding_model != configured {
                return Err(IndexError::Incompatible(format!(
                    "index was built with {} but {} is configured",
                    snapshot.manifest.embedding_model, configured
                )));
            }
            info!(
                passages = snapshot.len(),
                sources = snapshot.manifest.page_counters.len(),
                "index loaded"
            );
            let store = Self::with_snapshot(persist_dir, embedder, reader, chunking, snapshot);
            return Ok(OpenedIndex {
                store,
                report: None,
            });
        }

        info!(data_dir = %data_dir.display(), "indexing documents");
        let empty = IndexSnapshot::empty(embedder.model_name());
        let store = Self::with_snapshot(persist_dir, embedder, reader, chunking, empty);
        let report = store.ingest_directory(data_dir).await?;
        Ok(OpenedIndex {
            store,
            report: Some(report),
        })
    }

    fn with_snapshot(
        persist_dir: &Path,
        embedder: Arc<dyn Embedder>,
        reader: Arc<dyn PageReader>,
        chunking: ChunkingConfig,
        snapshot: IndexSnapshot,
    ) -> Self {
        Self {
            persist_dir: persist_dir.to_path_buf(),
            embedder,
            reader,
            chunking,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        }
    }

    /// The last persisted state.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn page_count(&self, source_path: &str) -> u32 {
        self.snapshot().page_count(source_path)
    }

    /// Indexes every supported file under `data_dir`. Files that cannot be
    /// read are skipped and reported.
    pub async fn ingest_directory(&self, data_dir: &Path) -> Result<IngestionReport, IndexError> {
        let _guard = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let mut report = IngestionReport::default();

        for path in discover_source_files(data_dir, self.reader.as_ref()) {
            let loaded = match self.read_source(&path).await? {
                Ok(loaded) => loaded,
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable document");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                    continue;
                }
            };

            next.remove_source(&loaded.source_path);
            let (pages, passages) = self.embed_source(&mut next, loaded).await?;
            report.indexed_files += 1;
            report.indexed_pages += pages;
            report.passages += passages;
        }

        self.commit(next).await?;
        info!(
            files = report.indexed_files,
            pages = report.indexed_pages,
            passages = report.passages,
            skipped = report.skipped_files.len(),
            "ingestion finished"
        );
        Ok(report)
    }

    /// Indexes a single file. A file whose checksum is already recorded is
    /// left alone; a changed file replaces its previous pages.
    pub async fn insert_file(&self, path: &Path) -> Result<InsertOutcome, IndexError> {
        let _guard = self.writer.lock().await;
        let loaded = self.read_source(path).await??;

        let current = self.snapshot();
        if current.manifest.checksums.get(&loaded.source_path) == Some(&loaded.checksum) {
            debug!(path = %path.display(), "document unchanged; not re-indexing");
            return Ok(InsertOutcome::Unchanged);
        }

        let mut next = (*current).clone();
        let replaced = next.remove_source(&loaded.source_path);
        let (pages, passages) = self.embed_source(&mut next, loaded).await?;
        self.commit(next).await?;

        info!(path = %path.display(), pages, passages, replaced, "document indexed");
        Ok(if replaced {
            InsertOutcome::Replaced { pages, passages }
        } else {
            InsertOutcome::Indexed { pages, passages }
        })
    }

    /// Appends pages to their sources, continuing each source's persisted
    /// page counter.
    pub async fn insert_pages(&self, inputs: Vec<PageInput>) -> Result<Vec<DocumentPage>, IndexError> {
        let _guard = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let mut inserted = Vec::with_capacity(inputs.len());

        for input in inputs {
            let counter = next
                .manifest
                .page_counters
                .entry(input.source_path.clone())
                .or_insert(0);
            let page = DocumentPage {
                source_path: input.source_path,
                page_index: *counter,
                text: input.text,
            };
            *counter += 1;

            self.embed_page(&mut next, &page).await?;
            inserted.push(page);
        }

        self.commit(next).await?;
        Ok(inserted)
    }

    /// The `k` passages most similar to `query`, best first.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>, IndexError> {
        let snapshot = self.snapshot();
        if k == 0 || snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;
        let mut scored = snapshot
            .nodes
            .iter()
            .map(|node| (cosine_similarity(&query_vector, &node.vector), node))
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, node)| ScoredPassage {
                passage: node.passage.clone(),
                score,
            })
            .collect())
    }

    /// Reads a source off the runtime threads. The outer error is a failed
    /// task, the inner one an unreadable document.
    async fn read_source(
        &self,
        path: &Path,
    ) -> Result<Result<LoadedSource, IngestError>, IndexError> {
        let reader = Arc::clone(&self.reader);
        let owned = path.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || load_source(&owned, reader.as_ref())).await?)
    }

    async fn embed_source(
        &self,
        snapshot: &mut IndexSnapshot,
        loaded: LoadedSource,
    ) -> Result<(usize, usize), IndexError> {
        let mut passages = 0;
        for page in &loaded.pages {
            passages += self.embed_page(snapshot, page).await?;
        }

        let next_index = loaded
            .pages
            .last()
            .map(|page| page.page_index + 1)
            .unwrap_or(0);
        snapshot
            .manifest
            .page_counters
            .insert(loaded.source_path.clone(), next_index);
        snapshot
            .manifest
            .checksums
            .insert(loaded.source_path, loaded.checksum);

        Ok((loaded.pages.len(), passages))
    }

    async fn embed_page(&self, snapshot: &mut IndexSnapshot, page: &DocumentPage) -> Result<usize, IndexError> {
        let passages = split_page(page, self.chunking);
        let count = passages.len();
        for passage in passages {
            let vector = self.embedder.embed(&passage.text).await?;
            snapshot.record_dimensions(vector.len())?;
            snapshot.nodes.push(StoredNode { passage, vector });
        }
        Ok(count)
    }

    async fn commit(&self, mut next: IndexSnapshot) -> Result<(), IndexError> {
        next.manifest.updated_at = Utc::now();
        next.manifest.node_count = next.nodes.len();
        persist_snapshot(&self.persist_dir, &next).await?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }
}

async fn persist_snapshot(dir: &Path, snapshot: &IndexSnapshot) -> Result<(), IndexError> {
    tokio::fs::create_dir_all(dir).await?;

    let docstore = serde_json::to_vec(&DocStoreRef {
        nodes: &snapshot.nodes,
    })?;
    write_atomic(&dir.join(DOCSTORE_FILE), &docstore).await?;

    let manifest = serde_json::to_vec_pretty(&snapshot.manifest)?;
    write_atomic(&dir.join(MARKER_FILE), &manifest).await?;

    debug!(path = %dir.display(), passages = snapshot.len(), "index persisted");
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let partial = path.with_extension("json.partial");
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, path).await?;
    Ok(())
}

fn corrupt(path: &Path, details: impl ToString) -> IndexError {
    IndexError::Corrupt {
        path: path.display().to_string(),
        details: details.to_string(),
    }
}

async fn load_snapshot(dir: &Path) -> Result<IndexSnapshot, IndexError> {
    let marker_path = dir.join(MARKER_FILE);
    let raw = tokio::fs::read(&marker_path).await?;
    let manifest: IndexManifest =
        serde_json::from_slice(&raw).map_err(|error| corrupt(&marker_path, error))?;

    if manifest.version != FORMAT_VERSION {
        return Err(IndexError::Incompatible(format!(
            "index format version {} is not {}",
            manifest.version, FORMAT_VERSION
        )));
    }

    let docstore_path = dir.join(DOCSTORE_FILE);
    let raw = match tokio::fs::read(&docstore_path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(corrupt(&docstore_path, "docstore is missing"));
        }
        Err(error) => return Err(error.into()),
    };
    let docstore: DocStore =
        serde_json::from_slice(&raw).map_err(|error| corrupt(&docstore_path, error))?;

    for node in &docstore.nodes {
        let counter = manifest
            .page_counters
            .get(&node.passage.source_path)
            .copied()
            .unwrap_or(0);
        if node.passage.page_index >= counter {
            return Err(corrupt(
                &docstore_path,
                format!(
                    "page {} of {} is beyond its recorded page count {}",
                    node.passage.page_index, node.passage.source_path, counter
                ),
            ));
        }
        if manifest.dimensions != 0 && node.vector.len() != manifest.dimensions {
            return Err(corrupt(
                &docstore_path,
                format!(
                    "vector of {} has {} dimensions, expected {}",
                    node.passage.node_id,
                    node.vector.len(),
                    manifest.dimensions
                ),
            ));
        }
    }

    Ok(IndexSnapshot {
        manifest,
        nodes: docstore.nodes,
    })
}
