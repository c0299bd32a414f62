//! Embedded filesystem over a metadata DB and an object store.
//!
//! The metadata snapshot restored from `{vol}-meta/` is a SQLite database
//! holding the volume format and a path tree; file content lives as chunk
//! objects under the volume's data prefix. The engine keeps the database in
//! WAL mode throughout so the replication tool can observe its writes.

use crate::cache::{CACHE_CAPACITY_BYTES, ChunkCache, WRITE_BUFFER_BYTES};
use crate::error::{FsError, FsResult};
use bytes::Bytes;
use cistern_storage::{ByteStream, ObjectStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Fixed id of the root directory node.
const ROOT_NODE: i64 = 1;

/// Default block size for chunked file content (KiB).
pub const DEFAULT_BLOCK_SIZE_KIB: i64 = 4096;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fs_format (
    name TEXT NOT NULL,
    storage TEXT NOT NULL,
    bucket TEXT NOT NULL,
    block_size_kib INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS fs_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    mtime_unix_ns INTEGER NOT NULL,
    UNIQUE (parent_id, name)
);
CREATE TABLE IF NOT EXISTS fs_chunks (
    node_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    object_key TEXT NOT NULL,
    size INTEGER NOT NULL,
    PRIMARY KEY (node_id, position)
);
"#;

/// Volume format loaded from the metadata DB.
#[derive(Clone, Debug)]
pub struct VolumeFormat {
    pub name: String,
    pub storage: String,
    pub bucket: String,
    pub block_size_kib: i64,
}

/// Kind of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "directory" {
            Self::Directory
        } else {
            Self::File
        }
    }
}

/// One directory entry.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    pub size: i64,
    pub modified_at: OffsetDateTime,
}

/// A page of directory entries.
#[derive(Clone, Debug)]
pub struct ListDirResult {
    pub entries: Vec<FileEntry>,
    pub has_more: bool,
}

struct Node {
    id: i64,
    kind: FileKind,
    size: i64,
    mtime_unix_ns: i64,
}

/// The embedded filesystem session for one volume.
pub struct FsEngine {
    pool: Pool<Sqlite>,
    store: Arc<dyn ObjectStore>,
    data_prefix: String,
    block_size: usize,
    cache: ChunkCache,
    format: VolumeFormat,
}

impl FsEngine {
    /// Open an existing metadata DB.
    ///
    /// Fails with `InvalidMetadata` when the database carries no volume
    /// format. The journal stays in WAL mode for the replication tool.
    pub async fn open(
        meta_db: &Path,
        store: Arc<dyn ObjectStore>,
        data_prefix: String,
        cache_dir: PathBuf,
    ) -> FsResult<Self> {
        let pool = open_pool(meta_db, false).await?;

        let format = match sqlx::query(
            "SELECT name, storage, bucket, block_size_kib FROM fs_format LIMIT 1",
        )
        .fetch_optional(&pool)
        .await
        {
            Ok(Some(row)) => VolumeFormat {
                name: row.get("name"),
                storage: row.get("storage"),
                bucket: row.get("bucket"),
                block_size_kib: row.get("block_size_kib"),
            },
            Ok(None) => {
                return Err(FsError::InvalidMetadata(
                    "metadata DB has no volume format".to_string(),
                ));
            }
            Err(e) => {
                return Err(FsError::InvalidMetadata(format!(
                    "failed to load volume format: {e}"
                )));
            }
        };

        let block_size = (format.block_size_kib.max(1) as usize) * 1024;
        Ok(Self {
            pool,
            store,
            data_prefix,
            block_size,
            cache: ChunkCache::new(cache_dir, CACHE_CAPACITY_BYTES),
            format,
        })
    }

    /// Initialize a fresh metadata DB, mirroring what the external FORMAT
    /// tool does for mounted volumes.
    pub async fn format(meta_db: &Path, name: &str, storage: &str, bucket: &str) -> FsResult<()> {
        let pool = open_pool(meta_db, true).await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        sqlx::query("INSERT INTO fs_format (name, storage, bucket, block_size_kib) VALUES (?, ?, ?, ?)")
            .bind(name)
            .bind(storage)
            .bind(bucket)
            .bind(DEFAULT_BLOCK_SIZE_KIB)
            .execute(&pool)
            .await?;
        sqlx::query(
            "INSERT INTO fs_nodes (id, parent_id, name, kind, size, mtime_unix_ns) \
             VALUES (?, NULL, '', 'directory', 0, ?)",
        )
        .bind(ROOT_NODE)
        .bind(now_ns())
        .execute(&pool)
        .await?;
        pool.close().await;
        Ok(())
    }

    /// The loaded volume format.
    pub fn volume_format(&self) -> &VolumeFormat {
        &self.format
    }

    /// Close the metadata session. Must be called before the snapshot is
    /// pushed so WAL contents are not in flight.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Flush the WAL into the main database file. The journal stays in WAL
    /// mode.
    pub async fn checkpoint(&self) -> FsResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List a directory page, entries sorted by name for stable pagination.
    pub async fn list_dir(
        &self,
        path: &str,
        limit: usize,
        offset: usize,
    ) -> FsResult<ListDirResult> {
        let node = self
            .lookup(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.kind != FileKind::Directory {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        // Fetch one extra row to learn whether more entries follow.
        let rows = sqlx::query(
            "SELECT name, kind, size, mtime_unix_ns FROM fs_nodes \
             WHERE parent_id = ? ORDER BY name LIMIT ? OFFSET ?",
        )
        .bind(node.id)
        .bind((limit + 1) as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > limit;
        let entries = rows
            .into_iter()
            .take(limit)
            .map(|row| {
                let name: String = row.get("name");
                let kind = FileKind::parse(row.get::<String, _>("kind").as_str());
                FileEntry {
                    path: join_path(path, &name),
                    name,
                    kind,
                    size: row.get("size"),
                    modified_at: from_ns(row.get("mtime_unix_ns")),
                }
            })
            .collect();

        Ok(ListDirResult { entries, has_more })
    }

    /// Stat a single path.
    pub async fn stat(&self, path: &str) -> FsResult<Option<FileEntry>> {
        let node = match self.lookup(path).await? {
            Some(node) => node,
            None => return Ok(None),
        };
        Ok(Some(FileEntry {
            name: path.rsplit('/').next().unwrap_or("").to_string(),
            path: path.to_string(),
            kind: node.kind,
            size: node.size,
            modified_at: from_ns(node.mtime_unix_ns),
        }))
    }

    /// Stream a file's content. Returns the stream and the file size.
    pub async fn download(&self, path: &str) -> FsResult<(ByteStream, i64)> {
        let node = self
            .lookup(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.kind == FileKind::Directory {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        let chunks: Vec<(String, i64)> = sqlx::query(
            "SELECT object_key, size FROM fs_chunks WHERE node_id = ? ORDER BY position",
        )
        .bind(node.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| (row.get("object_key"), row.get("size")))
        .collect();

        let store = self.store.clone();
        let cache_hits: Vec<Option<Bytes>> = {
            let mut hits = Vec::with_capacity(chunks.len());
            for (key, _) in &chunks {
                hits.push(self.cache.get(key).await);
            }
            hits
        };

        let stream = async_stream::try_stream! {
            for ((key, _size), cached) in chunks.into_iter().zip(cache_hits) {
                match cached {
                    Some(bytes) => yield bytes,
                    None => {
                        let bytes = store.get(&key).await?;
                        yield bytes;
                    }
                }
            }
        };

        Ok((Box::pin(stream), node.size))
    }

    /// Write a file from an async reader, creating parent directories and
    /// truncating any existing file first. Returns the bytes written.
    pub async fn upload<R>(&self, path: &str, mut content: R) -> FsResult<i64>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        use tokio::io::AsyncReadExt;

        let (parent_path, file_name) = split_path(path)?;
        let parent_id = self.mkdir_all(&parent_path).await?;
        let node_id = self.create_or_truncate(parent_id, &file_name, path).await?;

        let mut written: i64 = 0;
        let mut position: i64 = 0;
        let mut uploaded_keys = Vec::new();
        let mut buf = vec![0u8; self.block_size.min(WRITE_BUFFER_BYTES)];

        let result: FsResult<()> = async {
            loop {
                let filled = fill_buf(&mut content, &mut buf).await?;
                if filled == 0 {
                    break;
                }
                let block = Bytes::copy_from_slice(&buf[..filled]);
                let key = format!("{}chunks/{}", self.data_prefix, Uuid::new_v4().simple());

                self.store.put(&key, block.clone()).await?;
                self.cache.put(&key, &block).await;
                sqlx::query(
                    "INSERT INTO fs_chunks (node_id, position, object_key, size) VALUES (?, ?, ?, ?)",
                )
                .bind(node_id)
                .bind(position)
                .bind(&key)
                .bind(filled as i64)
                .execute(&self.pool)
                .await?;

                uploaded_keys.push(key);
                written += filled as i64;
                position += 1;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // Drop whatever was uploaded so no orphan chunks survive the
            // failed write.
            for key in &uploaded_keys {
                let _ = self.store.delete(key).await;
                self.cache.remove(key).await;
            }
            let _ = sqlx::query("DELETE FROM fs_chunks WHERE node_id = ?")
                .bind(node_id)
                .execute(&self.pool)
                .await;
            return Err(e);
        }

        sqlx::query("UPDATE fs_nodes SET size = ?, mtime_unix_ns = ? WHERE id = ?")
            .bind(written)
            .bind(now_ns())
            .bind(node_id)
            .execute(&self.pool)
            .await?;

        Ok(written)
    }

    /// Remove a path. Missing paths are treated as already deleted.
    ///
    /// Non-recursive removal of a non-empty directory fails; recursive
    /// removal deletes the whole tree and its chunk objects, bypassing any
    /// trash.
    pub async fn remove(&self, path: &str, recursive: bool) -> FsResult<()> {
        let node = match self.lookup(path).await? {
            Some(node) => node,
            None => return Ok(()),
        };
        if node.id == ROOT_NODE {
            return Err(FsError::InvalidPath("cannot remove the root".to_string()));
        }

        let mut node_ids = vec![node.id];
        if node.kind == FileKind::Directory {
            let mut frontier = vec![node.id];
            while let Some(parent) = frontier.pop() {
                let children: Vec<i64> =
                    sqlx::query("SELECT id FROM fs_nodes WHERE parent_id = ?")
                        .bind(parent)
                        .fetch_all(&self.pool)
                        .await?
                        .into_iter()
                        .map(|row| row.get("id"))
                        .collect();
                if !children.is_empty() && !recursive {
                    return Err(FsError::DirectoryNotEmpty(path.to_string()));
                }
                frontier.extend(&children);
                node_ids.extend(children);
            }
        }

        for node_id in &node_ids {
            let keys: Vec<String> = sqlx::query("SELECT object_key FROM fs_chunks WHERE node_id = ?")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.get("object_key"))
                .collect();
            for key in keys {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete chunk object");
                }
                self.cache.remove(&key).await;
            }
            sqlx::query("DELETE FROM fs_chunks WHERE node_id = ?")
                .bind(node_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM fs_nodes WHERE id = ?")
                .bind(node_id)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn lookup(&self, path: &str) -> FsResult<Option<Node>> {
        let components = path_components(path)?;
        let mut current = Node {
            id: ROOT_NODE,
            kind: FileKind::Directory,
            size: 0,
            mtime_unix_ns: 0,
        };

        for component in components {
            let row = sqlx::query(
                "SELECT id, kind, size, mtime_unix_ns FROM fs_nodes \
                 WHERE parent_id = ? AND name = ?",
            )
            .bind(current.id)
            .bind(component)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => {
                    current = Node {
                        id: row.get("id"),
                        kind: FileKind::parse(row.get::<String, _>("kind").as_str()),
                        size: row.get("size"),
                        mtime_unix_ns: row.get("mtime_unix_ns"),
                    };
                }
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    /// Ensure a directory path exists, returning its node id.
    async fn mkdir_all(&self, path: &str) -> FsResult<i64> {
        let components = path_components(path)?;
        let mut current = ROOT_NODE;

        for component in components {
            let row = sqlx::query("SELECT id, kind FROM fs_nodes WHERE parent_id = ? AND name = ?")
                .bind(current)
                .bind(component)
                .fetch_optional(&self.pool)
                .await?;

            current = match row {
                Some(row) => {
                    if FileKind::parse(row.get::<String, _>("kind").as_str()) != FileKind::Directory
                    {
                        return Err(FsError::NotADirectory(component.to_string()));
                    }
                    row.get("id")
                }
                None => {
                    let result = sqlx::query(
                        "INSERT INTO fs_nodes (parent_id, name, kind, size, mtime_unix_ns) \
                         VALUES (?, ?, 'directory', 0, ?)",
                    )
                    .bind(current)
                    .bind(component)
                    .bind(now_ns())
                    .execute(&self.pool)
                    .await?;
                    result.last_insert_rowid()
                }
            };
        }

        Ok(current)
    }

    /// Create a file node or truncate an existing one to zero. The
    /// underlying create does not overwrite, so an existing file has its
    /// chunks dropped explicitly.
    async fn create_or_truncate(
        &self,
        parent_id: i64,
        name: &str,
        full_path: &str,
    ) -> FsResult<i64> {
        let existing = sqlx::query("SELECT id, kind FROM fs_nodes WHERE parent_id = ? AND name = ?")
            .bind(parent_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = existing {
            if FileKind::parse(row.get::<String, _>("kind").as_str()) == FileKind::Directory {
                return Err(FsError::IsADirectory(full_path.to_string()));
            }
            let node_id: i64 = row.get("id");

            let keys: Vec<String> = sqlx::query("SELECT object_key FROM fs_chunks WHERE node_id = ?")
                .bind(node_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.get("object_key"))
                .collect();
            for key in keys {
                if let Err(e) = self.store.delete(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete truncated chunk");
                }
                self.cache.remove(&key).await;
            }
            sqlx::query("DELETE FROM fs_chunks WHERE node_id = ?")
                .bind(node_id)
                .execute(&self.pool)
                .await?;
            sqlx::query("UPDATE fs_nodes SET size = 0, mtime_unix_ns = ? WHERE id = ?")
                .bind(now_ns())
                .bind(node_id)
                .execute(&self.pool)
                .await?;
            return Ok(node_id);
        }

        let result = sqlx::query(
            "INSERT INTO fs_nodes (parent_id, name, kind, size, mtime_unix_ns) \
             VALUES (?, ?, 'file', 0, ?)",
        )
        .bind(parent_id)
        .bind(name)
        .bind(now_ns())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }
}

async fn open_pool(meta_db: &Path, create: bool) -> FsResult<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", meta_db.display()))
        .map_err(FsError::Database)?
        .create_if_missing(create)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

fn now_ns() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

fn from_ns(ns: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ns as i128)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Split an absolute path into components, rejecting traversal.
fn path_components(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath(format!("path must be absolute: {path}")));
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(FsError::InvalidPath(format!(
            "path must be canonical: {path}"
        )));
    }
    Ok(components)
}

/// Split a file path into (parent directory, file name).
fn split_path(path: &str) -> FsResult<(String, String)> {
    let components = path_components(path)?;
    let file_name = components
        .last()
        .ok_or_else(|| FsError::InvalidPath("path names no file".to_string()))?
        .to_string();
    let parent = if components.len() == 1 {
        "/".to_string()
    } else {
        format!("/{}", components[..components.len() - 1].join("/"))
    };
    Ok((parent, file_name))
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

/// Read from `reader` until the buffer is full or EOF. Returns bytes read.
async fn fill_buf<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
