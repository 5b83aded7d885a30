//! SQLite-backed [`Store`] implementation.
//!
//! The lexical index is an FTS5 table whose rowid mirrors `documents.id`;
//! its `bm25()` ranking is lower-is-better, which the lexical adapter in
//! `qmd-core` flips. Vectors are stored as little-endian f32 BLOBs and
//! scored by a brute-force dot product, keeping the best chunk per document.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use qmd_core::embedding::{blob_to_vec, dot, vec_to_blob};
use qmd_core::models::{
    Chunk, CleanupReport, CollectionStats, Content, Document, PathContext, PendingChunk,
    SearchFilter,
};
use qmd_core::store::{FtsQuery, LexicalHit, ScoreOrder, Store, VectorHit};
use qmd_core::{QmdError, Result};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Wrap a sqlx error as a storage error. Query syntax errors from FTS5
/// become [`QmdError::InvalidQuery`] so the lexical adapter can recover.
fn db_err(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> QmdError {
    let context = context.into();
    move |e| {
        if let sqlx::Error::Database(ref db) = e {
            let msg = db.message();
            if msg.contains("fts5") || msg.contains("syntax error") {
                return QmdError::InvalidQuery(msg.to_string());
            }
        }
        QmdError::storage(context, e)
    }
}

/// Quote one term or phrase for FTS5 `MATCH`.
fn fts_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn render_fts(query: &FtsQuery) -> Result<String> {
    match query {
        FtsQuery::Terms(terms) if terms.is_empty() => {
            Err(QmdError::InvalidQuery("no searchable terms".into()))
        }
        FtsQuery::Terms(terms) => Ok(terms
            .iter()
            .map(|t| fts_quote(t))
            .collect::<Vec<_>>()
            .join(" ")),
        FtsQuery::Phrase(phrase) => Ok(fts_quote(phrase)),
    }
}

/// `AND <column> IN (?, ?, ...)` for a restricted filter, empty otherwise.
fn collection_clause(filter: &SearchFilter, column: &str) -> String {
    match &filter.collections {
        None => String::new(),
        Some(names) if names.is_empty() => " AND 0".to_string(),
        Some(names) => format!(
            " AND {} IN ({})",
            column,
            vec!["?"; names.len()].join(", ")
        ),
    }
}

fn filter_names(filter: &SearchFilter) -> &[String] {
    filter.collections.as_deref().unwrap_or(&[])
}

fn row_to_document(row: &SqliteRow) -> Document {
    let active: i64 = row.get("active");
    Document {
        collection: row.get("collection"),
        path: row.get("path"),
        title: row.get("title"),
        hash: row.get("hash"),
        active: active != 0,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
        deactivated_at: row.get("deactivated_at"),
    }
}

const DOCUMENT_COLUMNS: &str =
    "collection, path, title, hash, active, created_at, modified_at, deactivated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn content_exists(&self, hash: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM content WHERE hash = ?")
            .bind(hash)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err(format!("content {hash}")))?;
        Ok(exists)
    }

    async fn get_content(&self, hash: &str) -> Result<Option<Content>> {
        let row = sqlx::query("SELECT hash, body, size FROM content WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err(format!("content {hash}")))?;

        Ok(row.map(|r| {
            let size: i64 = r.get("size");
            Content {
                hash: r.get("hash"),
                body: r.get("body"),
                size: size as usize,
            }
        }))
    }

    async fn insert_content(&self, content: &Content, chunks: &[Chunk]) -> Result<()> {
        let ctx = format!("content {}", content.hash);
        let mut tx = self.pool.begin().await.map_err(db_err(ctx.clone()))?;

        let inserted = sqlx::query(
            "INSERT INTO content (hash, body, size, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(&content.hash)
        .bind(&content.body)
        .bind(content.size as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(db_err(ctx.clone()))?
        .rows_affected();

        if inserted > 0 {
            for chunk in chunks {
                sqlx::query(
                    "INSERT OR IGNORE INTO chunks (hash, seq, pos, text) VALUES (?, ?, ?, ?)",
                )
                .bind(&chunk.hash)
                .bind(chunk.seq as i64)
                .bind(chunk.pos as i64)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(db_err(ctx.clone()))?;
            }
        }

        tx.commit().await.map_err(db_err(ctx))?;
        Ok(())
    }

    async fn get_chunks(&self, hash: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT hash, seq, pos, text FROM chunks WHERE hash = ? ORDER BY seq")
            .bind(hash)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err(format!("chunks {hash}")))?;

        Ok(rows
            .iter()
            .map(|r| {
                let seq: i64 = r.get("seq");
                let pos: i64 = r.get("pos");
                Chunk {
                    hash: r.get("hash"),
                    seq: seq as usize,
                    pos: pos as usize,
                    text: r.get("text"),
                }
            })
            .collect())
    }

    async fn get_document(&self, collection: &str, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ? AND path = ?"
        ))
        .bind(collection)
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err(format!("{collection}/{path}")))?;

        Ok(row.as_ref().map(row_to_document))
    }

    async fn find_by_docid(&self, prefix: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE active = 1 AND substr(hash, 1, ?) = ? ORDER BY collection, path"
        ))
        .bind(prefix.len() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!("docid #{prefix}")))?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE collection = ? AND active = 1 ORDER BY path"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err(format!("collection {collection}")))?;

        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, path, title, hash, active,
                                   created_at, modified_at, deactivated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, path) DO UPDATE SET
                title = excluded.title,
                hash = excluded.hash,
                active = excluded.active,
                modified_at = excluded.modified_at,
                deactivated_at = excluded.deactivated_at
            "#,
        )
        .bind(&doc.collection)
        .bind(&doc.path)
        .bind(&doc.title)
        .bind(&doc.hash)
        .bind(doc.active as i64)
        .bind(doc.created_at)
        .bind(doc.modified_at)
        .bind(doc.deactivated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("{}/{}", doc.collection, doc.path)))?;

        Ok(())
    }

    async fn deactivate_document(&self, collection: &str, path: &str, at: i64) -> Result<bool> {
        let ctx = format!("{collection}/{path}");
        let mut tx = self.pool.begin().await.map_err(db_err(ctx.clone()))?;

        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE collection = ? AND path = ? AND active = 1",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err(ctx.clone()))?;

        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("UPDATE documents SET active = 0, deactivated_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        sqlx::query("DELETE FROM documents_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        tx.commit().await.map_err(db_err(ctx))?;
        Ok(true)
    }

    async fn index_document(&self, doc: &Document, body: &str) -> Result<()> {
        let ctx = format!("{}/{}", doc.collection, doc.path);
        let mut tx = self.pool.begin().await.map_err(db_err(ctx.clone()))?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM documents WHERE collection = ? AND path = ?")
                .bind(&doc.collection)
                .bind(&doc.path)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err(ctx.clone()))?;

        sqlx::query("DELETE FROM documents_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        sqlx::query(
            "INSERT INTO documents_fts (rowid, collection, path, title, body) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&doc.collection)
        .bind(&doc.path)
        .bind(&doc.title)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(db_err(ctx.clone()))?;

        tx.commit().await.map_err(db_err(ctx))?;
        Ok(())
    }

    fn lexical_order(&self) -> ScoreOrder {
        ScoreOrder::LowerIsBetter
    }

    async fn keyword_search(
        &self,
        query: &FtsQuery,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        let fts = render_fts(query)?;
        // Title matches weigh ten times body matches.
        let sql = format!(
            r#"
            SELECT d.collection, d.path, d.title, d.hash,
                   bm25(documents_fts, 0.0, 0.0, 10.0, 1.0) AS score,
                   snippet(documents_fts, 3, '', '', '...', 32) AS snippet
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.rowid
            WHERE documents_fts MATCH ? AND d.active = 1{}
            ORDER BY score
            LIMIT ?
            "#,
            collection_clause(filter, "d.collection")
        );

        let mut q = sqlx::query(&sql).bind(&fts);
        for name in filter_names(filter) {
            q = q.bind(name);
        }
        let rows = q
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("keyword search"))?;

        Ok(rows
            .iter()
            .map(|r| LexicalHit {
                collection: r.get("collection"),
                path: r.get("path"),
                title: r.get("title"),
                hash: r.get("hash"),
                raw_score: r.get("score"),
                snippet: r.get("snippet"),
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let sql = format!(
            r#"
            SELECT d.collection, d.path, d.title, d.hash, e.seq, e.vector, c.text
            FROM embeddings e
            JOIN chunks c ON c.hash = e.hash AND c.seq = e.seq
            JOIN documents d ON d.hash = e.hash
            WHERE d.active = 1 AND e.model = ?{}
            ORDER BY d.collection, d.path, e.seq
            "#,
            collection_clause(filter, "d.collection")
        );

        let mut q = sqlx::query(&sql).bind(model);
        for name in filter_names(filter) {
            q = q.bind(name);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("vector search"))?;

        // Rows arrive grouped by document and in chunk order, so a strict
        // comparison keeps the earliest chunk on ties.
        let mut hits: Vec<VectorHit> = Vec::new();
        for r in &rows {
            let blob: Vec<u8> = r.get("vector");
            let score = dot(query_vec, &blob_to_vec(&blob));
            let collection: String = r.get("collection");
            let path: String = r.get("path");
            if let Some(last) = hits.last_mut() {
                if last.collection == collection && last.path == path {
                    if score > last.score {
                        let seq: i64 = r.get("seq");
                        last.seq = seq as usize;
                        last.score = score;
                        last.text = r.get("text");
                    }
                    continue;
                }
            }
            let seq: i64 = r.get("seq");
            hits.push(VectorHit {
                collection,
                path,
                title: r.get("title"),
                hash: r.get("hash"),
                seq: seq as usize,
                score,
                text: r.get("text"),
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn pending_chunks(&self, model: &str, filter: &SearchFilter) -> Result<Vec<PendingChunk>> {
        let sql = format!(
            r#"
            SELECT c.hash, c.seq, c.text, MIN(d.title) AS title
            FROM chunks c
            JOIN documents d ON d.hash = c.hash
            LEFT JOIN embeddings e ON e.hash = c.hash AND e.seq = c.seq AND e.model = ?
            WHERE d.active = 1 AND e.hash IS NULL{}
            GROUP BY c.hash, c.seq
            ORDER BY c.hash, c.seq
            "#,
            collection_clause(filter, "d.collection")
        );

        let mut q = sqlx::query(&sql).bind(model);
        for name in filter_names(filter) {
            q = q.bind(name);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("pending chunks"))?;

        Ok(rows
            .iter()
            .map(|r| {
                let seq: i64 = r.get("seq");
                PendingChunk {
                    hash: r.get("hash"),
                    seq: seq as usize,
                    title: r.get("title"),
                    text: r.get("text"),
                }
            })
            .collect())
    }

    async fn upsert_embedding(
        &self,
        hash: &str,
        seq: usize,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (hash, seq, model, dims, vector, embedded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash, seq) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector,
                embedded_at = excluded.embedded_at
            "#,
        )
        .bind(hash)
        .bind(seq as i64)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("embedding {hash}:{seq}")))?;

        Ok(())
    }

    async fn clear_embeddings(&self, filter: &SearchFilter) -> Result<usize> {
        let sql = format!(
            "DELETE FROM embeddings WHERE hash IN (SELECT hash FROM documents WHERE 1 = 1{})",
            collection_clause(filter, "collection")
        );
        let mut q = sqlx::query(&sql);
        for name in filter_names(filter) {
            q = q.bind(name);
        }
        let deleted = q
            .execute(&self.pool)
            .await
            .map_err(db_err("clear embeddings"))?
            .rows_affected();
        Ok(deleted as usize)
    }

    async fn purge_inactive(
        &self,
        cutoff: i64,
        collection: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let mut tx = self.pool.begin().await.map_err(db_err("cleanup"))?;

        let scope = if collection.is_some() {
            " AND collection = ?"
        } else {
            ""
        };

        let fts_sql = format!(
            "DELETE FROM documents_fts WHERE rowid IN (SELECT id FROM documents \
             WHERE active = 0 AND COALESCE(deactivated_at, modified_at) <= ?{scope})"
        );
        let mut q = sqlx::query(&fts_sql).bind(cutoff);
        if let Some(c) = collection {
            q = q.bind(c);
        }
        q.execute(&mut *tx).await.map_err(db_err("cleanup"))?;

        let doc_sql = format!(
            "DELETE FROM documents WHERE active = 0 \
             AND COALESCE(deactivated_at, modified_at) <= ?{scope}"
        );
        let mut q = sqlx::query(&doc_sql).bind(cutoff);
        if let Some(c) = collection {
            q = q.bind(c);
        }
        let documents = q
            .execute(&mut *tx)
            .await
            .map_err(db_err("cleanup documents"))?
            .rows_affected();

        let embeddings =
            sqlx::query("DELETE FROM embeddings WHERE hash NOT IN (SELECT hash FROM documents)")
                .execute(&mut *tx)
                .await
                .map_err(db_err("cleanup embeddings"))?
                .rows_affected();

        let chunks = sqlx::query("DELETE FROM chunks WHERE hash NOT IN (SELECT hash FROM documents)")
            .execute(&mut *tx)
            .await
            .map_err(db_err("cleanup chunks"))?
            .rows_affected();

        let contents =
            sqlx::query("DELETE FROM content WHERE hash NOT IN (SELECT hash FROM documents)")
                .execute(&mut *tx)
                .await
                .map_err(db_err("cleanup content"))?
                .rows_affected();

        // A dry run measures through the same statements, then discards them.
        if dry_run {
            tx.rollback().await.map_err(db_err("cleanup"))?;
        } else {
            tx.commit().await.map_err(db_err("cleanup"))?;
        }

        Ok(CleanupReport {
            documents: documents as usize,
            contents: contents as usize,
            chunks: chunks as usize,
            embeddings: embeddings as usize,
            ..Default::default()
        })
    }

    async fn stats(&self, model: Option<&str>) -> Result<Vec<CollectionStats>> {
        let rows = sqlx::query(
            r#"
            SELECT
                d.collection,
                SUM(CASE WHEN d.active = 1 THEN 1 ELSE 0 END) AS active_docs,
                SUM(CASE WHEN d.active = 0 THEN 1 ELSE 0 END) AS inactive_docs,
                COALESCE(SUM(CASE WHEN d.active = 1 THEN
                    (SELECT COUNT(*) FROM chunks c WHERE c.hash = d.hash) END), 0) AS chunk_count,
                COALESCE(SUM(CASE WHEN d.active = 1 THEN
                    (SELECT COUNT(*) FROM embeddings e
                     WHERE e.hash = d.hash AND e.model = ?1) END), 0) AS embedded_count
            FROM documents d
            GROUP BY d.collection
            ORDER BY d.collection
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("stats"))?;

        Ok(rows
            .iter()
            .map(|r| CollectionStats {
                collection: r.get("collection"),
                active_documents: r.get("active_docs"),
                inactive_documents: r.get("inactive_docs"),
                chunks: r.get("chunk_count"),
                embedded_chunks: r.get("embedded_count"),
            })
            .collect())
    }

    async fn content_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("stats"))
    }

    async fn set_path_context(&self, context: &PathContext) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO path_contexts (collection, path, description, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, path) DO UPDATE SET
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&context.collection)
        .bind(&context.path)
        .bind(&context.description)
        .bind(context.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err(format!("context {}/{}", context.collection, context.path)))?;
        Ok(())
    }

    async fn list_path_contexts(&self, collection: Option<&str>) -> Result<Vec<PathContext>> {
        let rows = sqlx::query(
            r#"
            SELECT collection, path, description, updated_at
            FROM path_contexts
            WHERE ?1 IS NULL OR collection = ?1
            ORDER BY collection, path
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("path contexts"))?;

        Ok(rows
            .iter()
            .map(|r| PathContext {
                collection: r.get("collection"),
                path: r.get("path"),
                description: r.get("description"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn remove_path_context(&self, collection: &str, path: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM path_contexts WHERE collection = ? AND path = ?")
            .bind(collection)
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(db_err(format!("context {collection}/{path}")))?
            .rows_affected();
        Ok(removed > 0)
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<usize> {
        let ctx = format!("rename {from} -> {to}");
        let mut tx = self.pool.begin().await.map_err(db_err(ctx.clone()))?;

        let taken: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE collection = ?")
                .bind(to)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err(ctx.clone()))?;
        if taken {
            return Err(QmdError::InvalidInput(format!(
                "collection '{to}' already has documents"
            )));
        }

        let moved = sqlx::query("UPDATE documents SET collection = ? WHERE collection = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?
            .rows_affected();

        sqlx::query("UPDATE documents_fts SET collection = ? WHERE collection = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        sqlx::query("UPDATE OR REPLACE path_contexts SET collection = ? WHERE collection = ?")
            .bind(to)
            .bind(from)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        tx.commit().await.map_err(db_err(ctx))?;
        Ok(moved as usize)
    }

    async fn drop_collection(&self, collection: &str) -> Result<usize> {
        let ctx = format!("drop {collection}");
        let mut tx = self.pool.begin().await.map_err(db_err(ctx.clone()))?;

        sqlx::query(
            "DELETE FROM documents_fts WHERE rowid IN (SELECT id FROM documents WHERE collection = ?)",
        )
        .bind(collection)
        .execute(&mut *tx)
        .await
        .map_err(db_err(ctx.clone()))?;

        let dropped = sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?
            .rows_affected();

        sqlx::query("DELETE FROM path_contexts WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(db_err(ctx.clone()))?;

        tx.commit().await.map_err(db_err(ctx))?;
        Ok(dropped as usize)
    }

    async fn cache_get(&self, key: &str, now: i64) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT response FROM llm_cache \
             WHERE cache_key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("cache"))
    }

    async fn cache_set(
        &self,
        key: &str,
        model: &str,
        response: &str,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_cache (cache_key, model, response, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                model = excluded.model,
                response = excluded.response,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(model)
        .bind(response)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("cache"))?;
        Ok(())
    }

    async fn purge_expired_cache(&self, now: i64, dry_run: bool) -> Result<usize> {
        if dry_run {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM llm_cache WHERE expires_at IS NOT NULL AND expires_at <= ?",
            )
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("cache cleanup"))?;
            return Ok(count as usize);
        }

        let deleted =
            sqlx::query("DELETE FROM llm_cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db_err("cache cleanup"))?
                .rows_affected();
        Ok(deleted as usize)
    }
}
