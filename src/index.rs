use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{RetrievedPassage, SourceMeta};

/// One row of the index: a chunk's text, its vector, and the citation
/// payload for the document it came from.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub position: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub source: SourceMeta,
}

/// A named on-disk vector collection backed by a single SQLite file in WAL
/// mode. All vectors in an index share one embedding model and dimension,
/// recorded in `index_meta` and validated on every open. Similarity is
/// cosine, fixed at creation.
pub struct VectorIndex {
    pool: SqlitePool,
    name: String,
    model: String,
    dims: usize,
}

impl VectorIndex {
    /// Open (or create) the index at `path`. Fails fast with
    /// `IndexModelMismatch` when the stored metadata disagrees with the
    /// active embedder's model or dims.
    pub async fn open(path: &Path, name: &str, model: &str, dims: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("cannot create index dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;

        let meta = sqlx::query("SELECT model, dims FROM index_meta WHERE name = ?")
            .bind(name)
            .fetch_optional(&pool)
            .await?;
        match meta {
            Some(row) => {
                let stored_model: String = row.get("model");
                let stored_dims: i64 = row.get("dims");
                if stored_model != model || stored_dims as usize != dims {
                    return Err(Error::IndexModelMismatch {
                        name: name.to_string(),
                        index_model: stored_model,
                        index_dims: stored_dims as usize,
                        active_model: model.to_string(),
                        active_dims: dims,
                    });
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO index_meta (name, model, dims, similarity, created_at) \
                     VALUES (?, ?, ?, 'cosine', ?)",
                )
                .bind(name)
                .bind(model)
                .bind(dims as i64)
                .bind(chrono::Utc::now().timestamp())
                .execute(&pool)
                .await?;
            }
        }

        Ok(Self {
            pool,
            name: name.to_string(),
            model: model.to_string(),
            dims,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Insert or overwrite entries in a single transaction. No-op on empty
    /// input. Safe to run concurrently with `search`: WAL readers see either
    /// the state before the transaction or after it, never a torn entry.
    pub async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_dims(entries)?;
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            insert_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        debug!(index = %self.name, count = entries.len(), "upserted entries");
        Ok(())
    }

    /// Replace every entry for `document_id` with `entries`, atomically.
    /// This is both the re-ingest policy and the rollback unit for atomic
    /// ingestion: if the transaction fails, prior entries stay untouched.
    pub async fn replace_document(&self, document_id: &str, entries: &[IndexEntry]) -> Result<()> {
        self.check_dims(entries)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            insert_entry(&mut tx, entry).await?;
        }
        tx.commit().await?;
        debug!(index = %self.name, document_id, count = entries.len(), "replaced document");
        Ok(())
    }

    /// Delete all entries for a document. Returns the number removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Brute-force cosine search over every stored vector. Results are
    /// ranked score descending; equal scores rank the most recently inserted
    /// entry first. Empty index yields an empty result.
    pub async fn search(&self, query_vec: &[f32], k: usize) -> Result<Vec<RetrievedPassage>> {
        if query_vec.len() != self.dims {
            return Err(Error::DimensionMismatch {
                expected: self.dims,
                got: query_vec.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT seq, chunk_id, text, source_json, embedding FROM entries")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(i64, RetrievedPassage)> = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let blob: Vec<u8> = row.get("embedding");
            let source: SourceMeta = serde_json::from_str(row.get::<String, _>("source_json").as_str())?;
            let score = cosine_similarity(query_vec, &blob_to_vec(&blob));
            scored.push((
                seq,
                RetrievedPassage {
                    chunk_id: row.get("chunk_id"),
                    text: row.get("text"),
                    source,
                    score,
                },
            ));
        }

        scored.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(seq_b.cmp(seq_a))
        });
        scored.truncate(k);
        Ok(scored.into_iter().map(|(_, p)| p).collect())
    }

    /// Full dump in insertion order, for rebuilds and debugging.
    pub async fn scan(&self) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, position, text, source_json, embedding \
             FROM entries ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            entries.push(IndexEntry {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                position: row.get::<i64, _>("position") as usize,
                text: row.get("text"),
                vector: blob_to_vec(&blob),
                source: serde_json::from_str(row.get::<String, _>("source_json").as_str())?,
            });
        }
        Ok(entries)
    }

    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn count_for_document(&self, document_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn check_dims(&self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            if entry.vector.len() != self.dims {
                return Err(Error::DimensionMismatch {
                    expected: self.dims,
                    got: entry.vector.len(),
                });
            }
        }
        Ok(())
    }
}

async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &IndexEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO entries (chunk_id, document_id, position, text, source_json, embedding, inserted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            position = excluded.position,
            text = excluded.text,
            source_json = excluded.source_json,
            embedding = excluded.embedding,
            inserted_at = excluded.inserted_at
        "#,
    )
    .bind(&entry.chunk_id)
    .bind(&entry.document_id)
    .bind(entry.position as i64)
    .bind(&entry.text)
    .bind(serde_json::to_string(&entry.source)?)
    .bind(vec_to_blob(&entry.vector))
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            name TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            similarity TEXT NOT NULL DEFAULT 'cosine',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            text TEXT NOT NULL,
            source_json TEXT NOT NULL,
            embedding BLOB NOT NULL,
            inserted_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_document_id ON entries(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}
