//! SQLite-backed semantic index of file chunks.
//!
//! Chunks live in one named collection per language. Each chunk keeps its
//! document text, the file it came from and a little-endian `f32` embedding
//! blob. Queries are answered by exhaustive cosine comparison, so reported
//! distances are `1 - cosine_similarity`.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::embedding::{Embedder, EmbeddingError};

pub const DEFAULT_INSERT_BATCH_SIZE: usize = 700;
const DISTANCE_METRIC: &str = "cosine";
const HNSW_M: u32 = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("failed to encode collection metadata: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("embedder returned {actual} vectors for {expected} documents")]
    EmbeddingCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file: String,
}

/// One embedded unit: `"file: <path>\n"` followed by the chunk text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChunk {
    pub id: String,
    pub document: String,
    pub metadata: ChunkMetadata,
}

impl IndexChunk {
    pub fn for_file(path: &str, chunk_text: &str) -> Self {
        Self::from_document(path, format!("file: {path}\n{chunk_text}"))
    }

    pub fn from_document(path: &str, document: String) -> Self {
        Self {
            id: chunk_id(path, &document),
            document,
            metadata: ChunkMetadata {
                file: path.to_string(),
            },
        }
    }
}

pub fn chunk_id(path: &str, document: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(document.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
}

/// Add/delete/query surface over the chunk collection.
pub trait IndexStore: Send {
    /// Drops every chunk and recreates the collection.
    fn reset(&mut self) -> Result<(), StoreError>;

    /// Embeds and stores chunks. Ids already present are skipped. Returns the
    /// number of chunks written.
    fn add(&mut self, chunks: &[IndexChunk]) -> Result<usize, StoreError>;

    fn delete_file(&mut self, path: &str) -> Result<usize, StoreError>;

    fn get_file(&self, path: &str) -> Result<Vec<IndexChunk>, StoreError>;

    /// Nearest neighbours for each text, closest first.
    fn query(&self, texts: &[String], n_results: usize) -> Result<Vec<Vec<SearchHit>>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

/// Drops repeated ids (the first occurrence wins) and writes the rest in
/// bounded batches.
pub fn insert_chunks(
    store: &mut dyn IndexStore,
    chunks: Vec<IndexChunk>,
    batch_size: usize,
) -> Result<usize, StoreError> {
    let mut seen = HashSet::new();
    let unique: Vec<IndexChunk> = chunks
        .into_iter()
        .filter(|chunk| seen.insert(chunk.id.clone()))
        .collect();

    let mut written = 0;
    for batch in unique.chunks(batch_size.max(1)) {
        written += store.add(batch)?;
    }
    debug!(written, "Inserted chunks");
    Ok(written)
}

pub struct SqliteIndexStore {
    conn: Connection,
    collection: String,
    embedder: Arc<dyn Embedder>,
}

impl SqliteIndexStore {
    pub fn open(
        path: &Path,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, collection, embedder)
    }

    pub fn open_in_memory(
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, collection, embedder)
    }

    fn with_connection(
        conn: Connection,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;
        let store = Self {
            conn,
            collection: collection.to_string(),
            embedder,
        };
        store.ensure_collection()?;
        Ok(store)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Metadata recorded when the collection was created.
    pub fn collection_metadata(&self) -> Result<Option<serde_json::Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT metadata FROM collections WHERE name = ?1",
                params![self.collection],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|text| serde_json::from_str(&text).map_err(StoreError::from))
            .transpose()
    }

    fn ensure_collection(&self) -> Result<(), StoreError> {
        let metadata = json!({ "hnsw:space": DISTANCE_METRIC, "hnsw:M": HNSW_M });
        self.conn.execute(
            "INSERT OR IGNORE INTO collections (name, embedding_model, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                self.collection,
                self.embedder.model_name(),
                serde_json::to_string(&metadata)?,
                timestamp_ms()
            ],
        )?;
        Ok(())
    }

    fn load_embeddings(&self) -> Result<Vec<(String, String, Vec<f32>)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT document, file, embedding FROM chunks WHERE collection = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![self.collection], |row| {
            let document: String = row.get(0)?;
            let file: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            Ok((document, file, blob_to_vec(&blob)))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

impl IndexStore for SqliteIndexStore {
    fn reset(&mut self) -> Result<(), StoreError> {
        let transaction = self.conn.transaction()?;
        transaction.execute(
            "DELETE FROM chunks WHERE collection = ?1",
            params![self.collection],
        )?;
        transaction.execute(
            "DELETE FROM collections WHERE name = ?1",
            params![self.collection],
        )?;
        transaction.commit()?;
        self.ensure_collection()?;
        info!(collection = %self.collection, "Reset index collection");
        Ok(())
    }

    fn add(&mut self, chunks: &[IndexChunk]) -> Result<usize, StoreError> {
        let pending: Vec<&IndexChunk> = {
            let mut exists = self
                .conn
                .prepare("SELECT 1 FROM chunks WHERE collection = ?1 AND id = ?2")?;
            let mut pending = Vec::new();
            for chunk in chunks {
                if !exists.exists(params![self.collection, chunk.id])? {
                    pending.push(chunk);
                }
            }
            pending
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let documents: Vec<String> = pending.iter().map(|chunk| chunk.document.clone()).collect();
        let vectors = self.embedder.embed(&documents)?;
        if vectors.len() != documents.len() {
            return Err(StoreError::EmbeddingCount {
                expected: documents.len(),
                actual: vectors.len(),
            });
        }

        let transaction = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut insert_stmt = transaction.prepare(
                "INSERT OR IGNORE INTO chunks (collection, id, file, document, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (chunk, vector) in pending.iter().zip(vectors.iter()) {
                written += insert_stmt.execute(params![
                    self.collection,
                    chunk.id,
                    chunk.metadata.file,
                    chunk.document,
                    embedding_to_bytes(vector)
                ])?;
            }
        }
        transaction.commit()?;
        Ok(written)
    }

    fn delete_file(&mut self, path: &str) -> Result<usize, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM chunks WHERE collection = ?1 AND file = ?2",
            params![self.collection, path],
        )?;
        debug!(path, removed, "Deleted chunks for file");
        Ok(removed)
    }

    fn get_file(&self, path: &str) -> Result<Vec<IndexChunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document, file FROM chunks
             WHERE collection = ?1 AND file = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![self.collection, path], |row| {
            Ok(IndexChunk {
                id: row.get(0)?,
                document: row.get(1)?,
                metadata: ChunkMetadata { file: row.get(2)? },
            })
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    fn query(&self, texts: &[String], n_results: usize) -> Result<Vec<Vec<SearchHit>>, StoreError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let queries = self.embedder.embed(texts)?;
        if queries.len() != texts.len() {
            return Err(StoreError::EmbeddingCount {
                expected: texts.len(),
                actual: queries.len(),
            });
        }
        let entries = self.load_embeddings()?;

        let results = queries
            .iter()
            .map(|query| {
                let mut scored: Vec<(usize, f32)> = entries
                    .iter()
                    .enumerate()
                    .map(|(index, (_, _, vector))| (index, cosine_distance(query, vector)))
                    .collect();
                scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
                scored
                    .into_iter()
                    .take(n_results)
                    .map(|(index, distance)| {
                        let (document, file, _) = &entries[index];
                        SearchHit {
                            document: document.clone(),
                            metadata: ChunkMetadata { file: file.clone() },
                            distance,
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(results)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE collection = ?1",
            params![self.collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            embedding_model TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            file TEXT NOT NULL,
            document TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(collection, file);
        "#,
    )
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    if blob.len() % 4 != 0 {
        return Vec::new();
    }
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
