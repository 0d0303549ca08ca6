//! greeter-store — SQLite persistence for visitors, guest captures and visits.
//!
//! One connection behind a mutex, shared between the frame loop (capture
//! writes) and greeting workers (greeting text writes).

use chrono::{DateTime, Utc};
use greeter_core::collaborators::{CaptureStore, PersistError};
use greeter_core::greeting::GreetingSink;
use greeter_core::matcher::{Gallery, IdentityIndex, KnownVisitor, Neighbor};
use greeter_core::types::{Embedding, GuestId, VisitorId};
use image::{ImageFormat, RgbImage};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("visitor {0} has a corrupt embedding")]
    CorruptEmbedding(String),
    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Encode(msg) => PersistError::Encode(msg),
            other => PersistError::Backend(other.to_string()),
        }
    }
}

/// An enrolled visitor, without the embedding payload.
#[derive(Debug, Clone)]
pub struct VisitorRecord {
    pub id: VisitorId,
    pub name: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
}

/// A stored guest capture.
#[derive(Debug, Clone)]
pub struct GuestRecord {
    pub id: GuestId,
    pub greeting_text: Option<String>,
    pub visitor_id: Option<VisitorId>,
    pub image_bytes: usize,
    pub created_at: DateTime<Utc>,
}

/// `$XDG_DATA_HOME/greeter/greeter.db`.
pub fn default_db_path() -> PathBuf {
    greeter_core::data_dir().join("greeter.db")
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self::with_connection(conn)?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS visitors (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              embedding BLOB NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guests (
              id TEXT PRIMARY KEY,
              image BLOB NOT NULL,
              greeting_text TEXT,
              visitor_id TEXT,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS visits (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              visitor_id TEXT NOT NULL,
              guest_id TEXT NOT NULL,
              remarks TEXT NOT NULL DEFAULT '',
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_visits_visitor ON visits(visitor_id);
            CREATE INDEX IF NOT EXISTS idx_guests_created ON guests(created_at);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn add_visitor(&self, name: &str, embedding: &Embedding) -> Result<VisitorId, StoreError> {
        let id = VisitorId(uuid::Uuid::new_v4().to_string());
        self.conn()?.execute(
            "INSERT INTO visitors(id, name, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.0, name, encode_embedding(embedding), now()],
        )?;
        tracing::info!(visitor = %id, name, dims = embedding.values.len(), "visitor enrolled");
        Ok(id)
    }

    pub fn list_visitors(&self) -> Result<Vec<VisitorRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, length(embedding), created_at FROM visitors ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let bytes: i64 = row.get(2)?;
            Ok(VisitorRecord {
                id: VisitorId(row.get(0)?),
                name: row.get(1)?,
                dimensions: bytes as usize / 4,
                created_at: parse_time(&row.get::<_, String>(3)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns false if no visitor had that id.
    pub fn remove_visitor(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM visitors WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Load every enrolled visitor into an in-memory gallery.
    pub fn load_gallery(&self) -> Result<Gallery, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, embedding FROM visitors")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, name, blob) = row?;
            let embedding = decode_embedding(&blob).ok_or_else(|| StoreError::CorruptEmbedding(id.clone()))?;
            entries.push(KnownVisitor {
                id: VisitorId(id),
                name,
                embedding,
            });
        }
        tracing::debug!(visitors = entries.len(), "gallery loaded");
        Ok(Gallery::new(entries))
    }

    /// JPEG-encode the person crop and insert a guest row.
    pub fn save_guest(&self, person: &RgbImage) -> Result<GuestId, StoreError> {
        let jpeg = encode_jpeg(person)?;
        let id = GuestId(uuid::Uuid::new_v4().to_string());
        self.conn()?.execute(
            "INSERT INTO guests(id, image, created_at) VALUES (?1, ?2, ?3)",
            params![id.0, jpeg, now()],
        )?;
        tracing::debug!(guest = %id, bytes = jpeg.len(), "guest capture stored");
        Ok(id)
    }

    /// Set the greeting text once. Returns false if the guest is unknown or
    /// already has a greeting.
    pub fn set_greeting(&self, guest_id: &GuestId, text: &str) -> Result<bool, StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE guests SET greeting_text = ?2 WHERE id = ?1 AND greeting_text IS NULL",
            params![guest_id.0, text],
        )?;
        Ok(updated > 0)
    }

    /// Log a visit and link the guest capture to the visitor.
    ///
    /// Returns true if this is the visitor's first logged visit.
    pub fn record_visit(
        &self,
        visitor_id: &VisitorId,
        guest_id: &GuestId,
        remarks: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let previous: i64 = tx.query_row(
            "SELECT COUNT(*) FROM visits WHERE visitor_id = ?1",
            params![visitor_id.0],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO visits(visitor_id, guest_id, remarks, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![visitor_id.0, guest_id.0, remarks, now()],
        )?;
        tx.execute(
            "UPDATE guests SET visitor_id = ?2 WHERE id = ?1",
            params![guest_id.0, visitor_id.0],
        )?;
        tx.commit()?;
        Ok(previous == 0)
    }

    /// Most recent guest captures first.
    pub fn list_guests(&self, limit: usize) -> Result<Vec<GuestRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, greeting_text, visitor_id, length(image), created_at
             FROM guests ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let bytes: i64 = row.get(3)?;
            Ok(GuestRecord {
                id: GuestId(row.get(0)?),
                greeting_text: row.get(1)?,
                visitor_id: row.get::<_, Option<String>>(2)?.map(VisitorId),
                image_bytes: bytes as usize,
                created_at: parse_time(&row.get::<_, String>(4)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stored JPEG for a guest, if any.
    pub fn guest_image(&self, guest_id: &GuestId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT image FROM guests WHERE id = ?1",
                params![guest_id.0],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl CaptureStore for Store {
    fn save_capture(&self, person: &RgbImage) -> Result<GuestId, PersistError> {
        Ok(self.save_guest(person)?)
    }
}

impl GreetingSink for Store {
    fn record_greeting(&self, guest_id: &GuestId, text: &str) -> Result<(), PersistError> {
        if !self.set_greeting(guest_id, text)? {
            tracing::warn!(guest = %guest_id, "greeting not recorded: unknown guest or already set");
        }
        Ok(())
    }
}

/// Identity index that reads the `visitors` table on every lookup, so
/// enrollments and removals made while the daemon runs take effect on the
/// next capture. Read-only.
pub struct LiveGallery {
    store: Arc<Store>,
}

impl LiveGallery {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl IdentityIndex for LiveGallery {
    fn nearest(&self, probe: &Embedding) -> Option<Neighbor> {
        match self.store.load_gallery() {
            Ok(gallery) => gallery.nearest(probe),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load visitors; treating face as unknown");
                None
            }
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, StoreError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Little-endian f32s.
fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Embedding> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Embedding { values })
}
