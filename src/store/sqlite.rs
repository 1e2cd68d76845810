use super::DurableStore;
use crate::error::StoreError;
use crate::types::{from_unix_millis, to_unix_millis, BlockEntry};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Row = (String, String, i64);

enum Command {
    Upsert(BlockEntry),
    Delete(IpAddr),
    FetchAll(Sender<rusqlite::Result<Vec<Row>>>),
}

struct Writer {
    tx: Sender<Command>,
    thread: JoinHandle<()>,
}

/// SQLite-backed store. One row per blackholed address; `last_seen` is kept
/// in Unix milliseconds.
///
/// The connection lives on a dedicated writer thread so a slow disk or a
/// locked database never blocks the async runtime. Commands run in the order
/// they were issued; write failures are logged by the writer.
pub struct SqliteStore {
    path: PathBuf,
    writer: Mutex<Option<Writer>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blackhole (
                address TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                last_seen INTEGER NOT NULL
            )",
            [],
        )?;
        info!("SQLite store initialized at {}", path.display());

        let (tx, rx) = mpsc::channel::<Command>();
        let thread = thread::spawn(move || run_writer(conn, rx));

        Ok(Self {
            path,
            writer: Mutex::new(Some(Writer { tx, thread })),
        })
    }

    fn send(&self, command: Command) -> Result<(), StoreError> {
        let guard = self.writer.lock();
        let writer = guard.as_ref().ok_or(StoreError::Closed)?;
        writer.tx.send(command).map_err(|_| StoreError::Closed)
    }
}

fn run_writer(conn: Connection, rx: Receiver<Command>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Upsert(entry) => {
                if let Err(e) = upsert(&conn, &entry) {
                    error!(
                        "Unable to add ({}, {}) to store: {}",
                        entry.address, entry.domain, e
                    );
                }
            }
            Command::Delete(address) => {
                if let Err(e) = delete(&conn, address) {
                    error!("Unable to delete {} from store: {}", address, e);
                }
            }
            Command::FetchAll(reply) => {
                let _ = reply.send(fetch_rows(&conn));
            }
        }
    }

    if let Err((_, e)) = conn.close() {
        error!("Unable to close SQLite connection: {}", e);
    }
    debug!("SQLite writer stopping.");
}

fn upsert(conn: &Connection, entry: &BlockEntry) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO blackhole (address, domain, last_seen) VALUES (?1, ?2, ?3)
         ON CONFLICT(address) DO UPDATE SET
            domain = excluded.domain,
            last_seen = excluded.last_seen",
    )?;
    stmt.execute(params![
        entry.address.to_string(),
        entry.domain,
        to_unix_millis(entry.last_seen)
    ])?;
    Ok(())
}

fn delete(conn: &Connection, address: IpAddr) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM blackhole WHERE address = ?1")?;
    stmt.execute(params![address.to_string()])?;
    Ok(())
}

fn fetch_rows(conn: &Connection) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached("SELECT address, domain, last_seen FROM blackhole")?;
    let rows = stmt.query_map([], |row| {
        Ok::<Row, rusqlite::Error>((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    rows.collect()
}

impl DurableStore for SqliteStore {
    /// Blocks until every previously issued write has been applied.
    fn fetch_all(&self) -> Result<Vec<BlockEntry>, StoreError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Command::FetchAll(reply_tx))?;
        let rows = reply_rx.recv().map_err(|_| StoreError::Closed)??;

        let mut entries = Vec::with_capacity(rows.len());
        for (address, domain, last_seen) in rows {
            match IpAddr::from_str(&address) {
                Ok(address) => entries.push(BlockEntry {
                    address,
                    domain,
                    last_seen: from_unix_millis(last_seen),
                }),
                Err(e) => warn!("Skipping stored entry with bad address '{}': {}", address, e),
            }
        }
        Ok(entries)
    }

    fn upsert(&self, entry: &BlockEntry) -> Result<(), StoreError> {
        self.send(Command::Upsert(entry.clone()))
    }

    fn delete(&self, address: IpAddr) -> Result<(), StoreError> {
        self.send(Command::Delete(address))
    }

    /// Drains queued writes and waits for the writer thread to exit.
    fn close(&self) -> Result<(), StoreError> {
        let Some(writer) = self.writer.lock().take() else {
            return Ok(());
        };
        drop(writer.tx);
        writer.thread.join().map_err(|_| StoreError::WriterPanicked)?;
        info!("SQLite store at {} closed", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_upsert_fetch_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("cache.db")).unwrap();
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();

        store.upsert(&BlockEntry::new(v4, "evil.com", at(1_000))).unwrap();
        store.upsert(&BlockEntry::new(v6, "evil.com", at(2_000))).unwrap();
        store.upsert(&BlockEntry::new(v4, "www.evil.com", at(3_000))).unwrap();

        let mut entries = store.fetch_all().unwrap();
        entries.sort_by_key(|e| e.last_seen);
        assert_eq!(
            entries,
            vec![
                BlockEntry::new(v6, "evil.com", at(2_000)),
                BlockEntry::new(v4, "www.evil.com", at(3_000)),
            ]
        );

        store.delete(v4).unwrap();
        store.delete(v4).unwrap();
        assert_eq!(store.fetch_all().unwrap().len(), 1);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let ip: IpAddr = "5.6.7.8".parse().unwrap();

        let store = SqliteStore::open(&path).unwrap();
        store.upsert(&BlockEntry::new(ip, "evil.com", at(42_000))).unwrap();
        // Close drains the queued upsert before returning.
        store.close().unwrap();
        assert!(matches!(store.delete(ip), Err(StoreError::Closed)));
        assert!(matches!(store.fetch_all(), Err(StoreError::Closed)));
        store.close().unwrap();

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.fetch_all().unwrap(),
            vec![BlockEntry::new(ip, "evil.com", at(42_000))]
        );
    }

    #[test]
    fn test_writes_do_not_wait_for_locked_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = SqliteStore::open(&path).unwrap();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        let other = Connection::open(&path).unwrap();
        other.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let started = Instant::now();
        store.upsert(&BlockEntry::new(ip, "evil.com", at(1_000))).unwrap();
        store.delete("9.9.9.9".parse().unwrap()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        other.execute_batch("COMMIT").unwrap();
        assert_eq!(
            store.fetch_all().unwrap(),
            vec![BlockEntry::new(ip, "evil.com", at(1_000))]
        );
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .upsert(&BlockEntry::new("1.2.3.4".parse().unwrap(), "evil.com", at(1)))
            .unwrap();
        // Flush the queued upsert.
        store.fetch_all().unwrap();

        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "INSERT INTO blackhole (address, domain, last_seen) VALUES ('not-an-ip', 'x.com', 1)",
            [],
        )
        .unwrap();

        assert_eq!(store.fetch_all().unwrap().len(), 1);
    }
}
