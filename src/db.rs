use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{AppError, Result};
use crate::models::{
    HistoryEntry, HistoryStatus, NewHistory, Playlist, PlaylistItem, Video,
};

/// Highest migration this build knows how to apply.
const SCHEMA_VERSION: i64 = 1;

const VIDEO_COLUMNS: &str = "v.id, v.title, v.duration, v.channel, v.upload_date, v.url, \
     v.file_path, v.thumbnail_url, v.description, v.created_at, v.updated_at";

const HISTORY_SELECT: &str = r#"
    SELECT h.id, h.video_id, h.playlist_id, h.status, h.file_path, h.file_size,
           h.download_started_at, h.download_completed_at, h.error_message, h.created_at,
           v.title, v.url, p.title
    FROM history h
    LEFT JOIN videos v ON h.video_id = v.id
    LEFT JOIN playlists p ON h.playlist_id = p.id
"#;

/// Determines the per-user app data directory.
///
/// macOS:  ~/Library/Application Support/Tubeshelf
/// Windows: %APPDATA%\\Tubeshelf
/// Linux:  ~/.local/share/tubeshelf (depending on XDG)
pub fn app_project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from("com", "tubeshelf", "Tubeshelf")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))
}

/// Returns the directory where Tubeshelf stores its state (db, logs).
pub fn app_data_dir() -> anyhow::Result<PathBuf> {
    Ok(app_project_dirs()?.data_dir().to_path_buf())
}

/// Owns the SQLite connection for the library.
///
/// `rusqlite::Connection` is not `Sync`; share it through [`Store`].
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create db dir: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db: {}", path.display()))?;
        let db = Self::init(conn)?;
        log::info!("Opened database at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        // - WAL so readers don't block the single writer
        // - foreign keys ON, required for cascade / set-null
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| AppError::Persistence(e))
    }

    // ------------------------------------------------------------------
    // Videos
    // ------------------------------------------------------------------

    /// Insert or update a video. Optional fields that are `None` keep their stored value.
    pub fn upsert_video(&mut self, video: &Video) -> Result<()> {
        let now = Utc::now();
        self.conn.execute(
            r#"
            INSERT INTO videos (
              id, title, duration, channel, upload_date, url,
              file_path, thumbnail_url, description, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(id) DO UPDATE SET
              title = excluded.title,
              duration = COALESCE(excluded.duration, videos.duration),
              channel = COALESCE(excluded.channel, videos.channel),
              upload_date = COALESCE(excluded.upload_date, videos.upload_date),
              url = excluded.url,
              file_path = COALESCE(excluded.file_path, videos.file_path),
              thumbnail_url = COALESCE(excluded.thumbnail_url, videos.thumbnail_url),
              description = COALESCE(excluded.description, videos.description),
              updated_at = excluded.updated_at
            "#,
            params![
                video.id,
                video.title,
                video.duration,
                video.channel,
                video.upload_date,
                video.url,
                video.file_path,
                video.thumbnail_url,
                video.description,
                now
            ],
        )?;
        log::debug!("Video {} upserted", video.id);
        Ok(())
    }

    pub fn get_video(&mut self, id: &str) -> Result<Option<Video>> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos v WHERE v.id = ?1");
        let video = self
            .conn
            .query_row(&sql, params![id], |r| Self::row_to_video(r, 0))
            .optional()?;
        Ok(video)
    }

    /// Videos ordered by most recently updated.
    pub fn list_videos(&mut self, limit: u32) -> Result<Vec<Video>> {
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos v ORDER BY v.updated_at DESC, v.id ASC LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], |r| Self::row_to_video(r, 0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Record where a downloaded file ended up.
    pub fn set_video_file_path(&mut self, id: &str, file_path: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE videos SET file_path = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, file_path, Utc::now()],
        )?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("video {id}")));
        }
        Ok(())
    }

    /// Delete a video. Playlist links cascade; history rows keep a NULL reference.
    pub fn delete_video(&mut self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM videos WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Playlists
    // ------------------------------------------------------------------

    pub fn upsert_playlist(&mut self, playlist: &Playlist) -> Result<()> {
        let now = Utc::now();
        self.conn.execute(
            r#"
            INSERT INTO playlists (id, title, description, url, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(id) DO UPDATE SET
              title = excluded.title,
              description = COALESCE(excluded.description, playlists.description),
              url = COALESCE(excluded.url, playlists.url),
              updated_at = excluded.updated_at
            "#,
            params![
                playlist.id,
                playlist.title,
                playlist.description,
                playlist.url,
                now
            ],
        )?;
        log::debug!("Playlist {} upserted", playlist.id);
        Ok(())
    }

    pub fn get_playlist(&mut self, id: &str) -> Result<Option<Playlist>> {
        let playlist = self
            .conn
            .query_row(
                "SELECT id, title, description, url, created_at, updated_at FROM playlists WHERE id = ?1",
                params![id],
                Self::row_to_playlist,
            )
            .optional()?;
        Ok(playlist)
    }

    pub fn list_playlists(&mut self) -> Result<Vec<Playlist>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, url, created_at, updated_at FROM playlists ORDER BY title ASC",
        )?;
        let rows = stmt.query_map([], Self::row_to_playlist)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete a playlist. Its links cascade; videos and history rows survive.
    pub fn delete_playlist(&mut self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Playlist membership
    // ------------------------------------------------------------------

    /// Link a video into a playlist at `position`, moving it if already linked.
    pub fn link_video(&mut self, playlist_id: &str, video_id: &str, position: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO playlist_videos (playlist_id, video_id, position, added_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(playlist_id, video_id) DO UPDATE SET position = excluded.position
            "#,
            params![playlist_id, video_id, position, Utc::now()],
        )?;
        Ok(())
    }

    /// Link a video after the current last position. Returns the assigned position.
    pub fn append_video(&mut self, playlist_id: &str, video_id: &str) -> Result<i64> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM playlist_videos WHERE playlist_id = ?1",
            params![playlist_id],
            |r| r.get(0),
        )?;
        self.link_video(playlist_id, video_id, next)?;
        Ok(next)
    }

    pub fn unlink_video(&mut self, playlist_id: &str, video_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM playlist_videos WHERE playlist_id = ?1 AND video_id = ?2",
            params![playlist_id, video_id],
        )?;
        Ok(deleted > 0)
    }

    /// Videos of a playlist in position order. Ties break on insertion time, then id.
    pub fn get_playlist_items(&mut self, playlist_id: &str) -> Result<Vec<PlaylistItem>> {
        let sql = format!(
            r#"
            SELECT {VIDEO_COLUMNS}, pv.position, pv.added_at
            FROM videos v
            INNER JOIN playlist_videos pv ON v.id = pv.video_id
            WHERE pv.playlist_id = ?1
            ORDER BY pv.position ASC, pv.added_at ASC, v.id ASC
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![playlist_id], |r| {
            Ok(PlaylistItem {
                video: Self::row_to_video(r, 0)?,
                position: r.get(11)?,
                added_at: r.get(12)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Renumber positions to 0..n, keeping the current order. Returns the item count.
    pub fn compact_positions(&mut self, playlist_id: &str) -> Result<usize> {
        let items = self.get_playlist_items(playlist_id)?;
        let tx = self.conn.transaction()?;
        for (idx, item) in items.iter().enumerate() {
            tx.execute(
                "UPDATE playlist_videos SET position = ?3 WHERE playlist_id = ?1 AND video_id = ?2",
                params![playlist_id, item.video.id, idx as i64],
            )?;
        }
        tx.commit()?;
        Ok(items.len())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append a history row. Status defaults to `pending`.
    pub fn add_history(&mut self, entry: &NewHistory) -> Result<i64> {
        let now = Utc::now();
        self.conn.execute(
            r#"
            INSERT INTO history (
              video_id, playlist_id, status, file_path, file_size,
              download_started_at, download_completed_at, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.video_id,
                entry.playlist_id,
                entry.status.unwrap_or(HistoryStatus::Pending).as_str(),
                entry.file_path,
                entry.file_size,
                entry.download_started_at,
                entry.download_completed_at,
                entry.error_message,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        log::debug!("History entry {} added", id);
        Ok(id)
    }

    pub fn get_history_entry(&mut self, id: i64) -> Result<Option<HistoryEntry>> {
        let sql = format!("{HISTORY_SELECT} WHERE h.id = ?1");
        let entry = self
            .conn
            .query_row(&sql, params![id], Self::row_to_history)
            .optional()?;
        Ok(entry)
    }

    /// Most recent attempts first.
    pub fn list_history(&mut self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let sql = format!("{HISTORY_SELECT} ORDER BY h.created_at DESC, h.id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], Self::row_to_history)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn latest_history_for_video(&mut self, video_id: &str) -> Result<Option<HistoryEntry>> {
        let sql = format!(
            "{HISTORY_SELECT} WHERE h.video_id = ?1 ORDER BY h.created_at DESC, h.id DESC LIMIT 1"
        );
        let entry = self
            .conn
            .query_row(&sql, params![video_id], Self::row_to_history)
            .optional()?;
        Ok(entry)
    }

    pub fn mark_history_downloading(&mut self, id: i64) -> Result<()> {
        self.update_history(
            "UPDATE history SET status = ?2, download_started_at = ?3 WHERE id = ?1",
            params![id, HistoryStatus::Downloading.as_str(), Utc::now()],
            id,
        )
    }

    /// Attach the video discovered by a metadata fetch to a history row.
    pub fn attach_history_video(&mut self, id: i64, video_id: &str) -> Result<()> {
        self.update_history(
            "UPDATE history SET video_id = ?2 WHERE id = ?1",
            params![id, video_id],
            id,
        )
    }

    pub fn complete_history(
        &mut self,
        id: i64,
        file_path: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<()> {
        self.update_history(
            r#"
            UPDATE history
            SET status = ?2, download_completed_at = ?3, file_path = ?4, file_size = ?5,
                error_message = NULL
            WHERE id = ?1
            "#,
            params![
                id,
                HistoryStatus::Completed.as_str(),
                Utc::now(),
                file_path,
                file_size
            ],
            id,
        )
    }

    pub fn fail_history(&mut self, id: i64, error_message: &str) -> Result<()> {
        self.update_history(
            r#"
            UPDATE history
            SET status = ?2, download_completed_at = ?3, error_message = ?4
            WHERE id = ?1
            "#,
            params![id, HistoryStatus::Failed.as_str(), Utc::now(), error_message],
            id,
        )
    }

    pub fn delete_history(&mut self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM history WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Remove every history row. Returns the number removed.
    pub fn clear_history(&mut self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM history", [])?)
    }

    pub fn count_history_by_status(&mut self, status: HistoryStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM history WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn update_history(&mut self, sql: &str, params: &[&dyn rusqlite::ToSql], id: i64) -> Result<()> {
        let updated = self.conn.execute(sql, params)?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("history entry {id}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn row_to_video(row: &Row, offset: usize) -> rusqlite::Result<Video> {
        Ok(Video {
            id: row.get(offset)?,
            title: row.get(offset + 1)?,
            duration: row.get(offset + 2)?,
            channel: row.get(offset + 3)?,
            upload_date: row.get(offset + 4)?,
            url: row.get(offset + 5)?,
            file_path: row.get(offset + 6)?,
            thumbnail_url: row.get(offset + 7)?,
            description: row.get(offset + 8)?,
            created_at: row.get(offset + 9)?,
            updated_at: row.get(offset + 10)?,
        })
    }

    fn row_to_playlist(row: &Row) -> rusqlite::Result<Playlist> {
        Ok(Playlist {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            url: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<HistoryEntry> {
        let status: String = row.get(3)?;
        let status = HistoryStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?;
        let download_started_at: Option<DateTime<Utc>> = row.get(6)?;
        let download_completed_at: Option<DateTime<Utc>> = row.get(7)?;

        Ok(HistoryEntry {
            id: row.get(0)?,
            video_id: row.get(1)?,
            playlist_id: row.get(2)?,
            status,
            file_path: row.get(4)?,
            file_size: row.get(5)?,
            download_started_at,
            download_completed_at,
            error_message: row.get(8)?,
            created_at: row.get(9)?,
            video_title: row.get(10)?,
            video_url: row.get(11)?,
            playlist_title: row.get(12)?,
        })
    }
}

/// Process-wide store handle. Every access is serialized through one mutex,
/// so worker threads and the UI thread never write concurrently.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Db>>,
}

impl Store {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(Db::open(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Db::open_in_memory()?))
    }

    /// Run `f` with exclusive access to the database.
    pub fn with<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        f(&mut guard)
    }

    fn lock(&self) -> MutexGuard<'_, Db> {
        // A panic inside a previous closure cannot leave SQLite half-written
        // outside a transaction, so the poisoned guard is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| {
            log::warn!("Store mutex was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Explicit teardown. Only the last handle actually closes the connection.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let db = mutex.into_inner().unwrap_or_else(|p| p.into_inner());
                db.close()?;
                log::info!("Database connection closed");
                Ok(())
            }
            Err(_) => {
                log::warn!("Store still shared at close; connection stays open until last handle drops");
                Ok(())
            }
        }
    }
}

/// Runs every migration newer than the stored `schema_version`.
fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(anyhow!(
            "db schema version {} is newer than app supports {}",
            current_version,
            SCHEMA_VERSION
        ));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
        log::info!("Database schema initialized (v1)");
    }

    Ok(())
}

fn set_schema_version(conn: &mut Connection, v: i64) -> anyhow::Result<()> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
          id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          duration INTEGER,
          channel TEXT,
          upload_date TEXT,
          url TEXT NOT NULL,
          file_path TEXT,
          thumbnail_url TEXT,
          description TEXT,
          created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
          updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel);

        CREATE TABLE IF NOT EXISTS playlists (
          id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          description TEXT,
          url TEXT,
          created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
          updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS playlist_videos (
          playlist_id TEXT NOT NULL,
          video_id TEXT NOT NULL,
          position INTEGER NOT NULL DEFAULT 0,
          added_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
          PRIMARY KEY (playlist_id, video_id),
          FOREIGN KEY(playlist_id) REFERENCES playlists(id) ON DELETE CASCADE,
          FOREIGN KEY(video_id) REFERENCES videos(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_playlist_videos_playlist ON playlist_videos(playlist_id, position);
        CREATE INDEX IF NOT EXISTS idx_playlist_videos_video ON playlist_videos(video_id);

        CREATE TABLE IF NOT EXISTS history (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          video_id TEXT,
          playlist_id TEXT,
          status TEXT NOT NULL CHECK (status IN ('pending', 'downloading', 'completed', 'failed')),
          file_path TEXT,
          file_size INTEGER,
          download_started_at TIMESTAMP,
          download_completed_at TIMESTAMP,
          error_message TEXT,
          created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
          FOREIGN KEY(video_id) REFERENCES videos(id) ON DELETE SET NULL,
          FOREIGN KEY(playlist_id) REFERENCES playlists(id) ON DELETE SET NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_video_id ON history(video_id);
        CREATE INDEX IF NOT EXISTS idx_history_playlist_id ON history(playlist_id);
        CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);
        CREATE INDEX IF NOT EXISTS idx_history_created_at ON history(created_at);

        CREATE TABLE IF NOT EXISTS settings (
          key TEXT PRIMARY KEY,
          value TEXT,
          updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    Ok(())
}
