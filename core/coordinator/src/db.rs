//! SQLite persistence for the coordinator.
//!
//! Repositories and branches are rows; each branch carries its authoritative
//! tick and an optional base snapshot. Accepted events live in an append-only
//! table keyed by (repo, branch, tick). Callers serialize writes per branch;
//! SQLite only has to keep different branches from corrupting each other.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;

use tandem_protocol::{ArtifactEvent, Branch, Repository, StampedEvent, Tick};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Returns `false` when a repository with that name already exists.
    pub fn insert_repository(&self, repo: &Repository) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "INSERT INTO repositories (name, hash, file, file_type, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(name) DO NOTHING",
                    params![
                        repo.name,
                        repo.hash,
                        repo.file,
                        repo.file_type,
                        repo.date.to_rfc3339()
                    ],
                )
                .map_err(|err| format!("Failed to insert repository: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn get_repository(&self, name: &str) -> Result<Option<Repository>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT name, hash, file, file_type, created_at FROM repositories WHERE name = ?1",
                params![name],
                repository_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query repository: {}", err))
        })
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, hash, file, file_type, created_at FROM repositories \
                     ORDER BY created_at ASC, name ASC",
                )
                .map_err(|err| format!("Failed to prepare repositories query: {}", err))?;
            let rows = stmt
                .query_map([], repository_from_row)
                .map_err(|err| format!("Failed to read repository rows: {}", err))?;

            let mut repos = Vec::new();
            for row in rows {
                repos.push(row.map_err(|err| format!("Failed to decode repository row: {}", err))?);
            }
            Ok(repos)
        })
    }

    /// Returns `false` when the repository already has a branch with that name.
    pub fn insert_branch(&self, branch: &Branch) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "INSERT INTO branches (repo, name, created_at, tick) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(repo, name) DO NOTHING",
                    params![
                        branch.repo,
                        branch.name,
                        branch.date.to_rfc3339(),
                        branch.tick
                    ],
                )
                .map_err(|err| format!("Failed to insert branch: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn get_branch(&self, repo: &str, name: &str) -> Result<Option<Branch>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT repo, name, created_at, tick FROM branches WHERE repo = ?1 AND name = ?2",
                params![repo, name],
                branch_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query branch: {}", err))
        })
    }

    pub fn list_branches(&self, repo: &str) -> Result<Vec<Branch>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT repo, name, created_at, tick FROM branches WHERE repo = ?1 \
                     ORDER BY created_at ASC, name ASC",
                )
                .map_err(|err| format!("Failed to prepare branches query: {}", err))?;
            let rows = stmt
                .query_map(params![repo], branch_from_row)
                .map_err(|err| format!("Failed to read branch rows: {}", err))?;

            let mut branches = Vec::new();
            for row in rows {
                branches.push(row.map_err(|err| format!("Failed to decode branch row: {}", err))?);
            }
            Ok(branches)
        })
    }

    /// Stores the base snapshot of a branch, drops its history and resets the
    /// branch tick to zero.
    pub fn store_snapshot(&self, repo: &str, branch: &str, content: &[u8]) -> Result<(), String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start snapshot transaction: {}", err))?;
            tx.execute(
                "DELETE FROM events WHERE repo = ?1 AND branch = ?2",
                params![repo, branch],
            )
            .map_err(|err| format!("Failed to clear branch history: {}", err))?;
            tx.execute(
                "UPDATE branches SET snapshot = ?3, tick = 0 WHERE repo = ?1 AND name = ?2",
                params![repo, branch, content],
            )
            .map_err(|err| format!("Failed to store snapshot: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit snapshot: {}", err))
        })
    }

    pub fn load_snapshot(&self, repo: &str, branch: &str) -> Result<Option<Vec<u8>>, String> {
        self.with_connection(|conn| {
            let snapshot: Option<Option<Vec<u8>>> = conn
                .query_row(
                    "SELECT snapshot FROM branches WHERE repo = ?1 AND name = ?2",
                    params![repo, branch],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query snapshot: {}", err))?;
            Ok(snapshot.flatten())
        })
    }

    /// Appends an accepted event and advances the branch tick in one
    /// transaction.
    pub fn append_event(&self, repo: &str, branch: &str, event: &StampedEvent) -> Result<(), String> {
        self.with_connection(|conn| {
            let payload = serde_json::to_string(&event.event)
                .map_err(|err| format!("Failed to serialize event payload: {}", err))?;

            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start event transaction: {}", err))?;
            tx.execute(
                "INSERT INTO events (repo, branch, tick, author, payload, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    repo,
                    branch,
                    event.tick,
                    event.author,
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|err| format!("Failed to insert event: {}", err))?;
            tx.execute(
                "UPDATE branches SET tick = ?3 WHERE repo = ?1 AND name = ?2",
                params![repo, branch, event.tick],
            )
            .map_err(|err| format!("Failed to advance branch tick: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit event: {}", err))
        })
    }

    /// Events with a tick strictly greater than `after`, in tick order.
    pub fn events_after(
        &self,
        repo: &str,
        branch: &str,
        after: Tick,
    ) -> Result<Vec<StampedEvent>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT tick, author, payload FROM events \
                     WHERE repo = ?1 AND branch = ?2 AND tick > ?3 \
                     ORDER BY tick ASC",
                )
                .map_err(|err| format!("Failed to prepare events query: {}", err))?;
            let rows = stmt
                .query_map(params![repo, branch, after], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| format!("Failed to read event rows: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                let (tick, author, payload) =
                    row.map_err(|err| format!("Failed to decode event row: {}", err))?;
                let event: ArtifactEvent = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse event payload: {}", err))?;
                events.push(StampedEvent {
                    tick,
                    author,
                    event,
                });
            }
            Ok(events)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS repositories (
                    name TEXT PRIMARY KEY,
                    hash TEXT NOT NULL,
                    file TEXT NOT NULL,
                    file_type TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS branches (
                    repo TEXT NOT NULL REFERENCES repositories(name),
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    tick INTEGER NOT NULL DEFAULT -1,
                    snapshot BLOB,
                    PRIMARY KEY (repo, name)
                 );
                 CREATE TABLE IF NOT EXISTS events (
                    repo TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    tick INTEGER NOT NULL,
                    author TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (repo, branch, tick)
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create coordinator data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        name: row.get(0)?,
        hash: row.get(1)?,
        file: row.get(2)?,
        file_type: row.get(3)?,
        date: parse_timestamp(row.get::<_, String>(4)?),
    })
}

fn branch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        repo: row.get(0)?,
        name: row.get(1)?,
        date: parse_timestamp(row.get::<_, String>(2)?),
        tick: row.get(3)?,
    })
}

fn parse_timestamp(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|err| {
            tracing::warn!(value = %value, error = %err, "Unparseable timestamp in store");
            DateTime::<Utc>::default()
        })
}
