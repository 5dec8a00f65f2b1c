//! A durable FIFO of MQTT messages, backed by a single SQLite file.
//!
//! Messages that cannot be published while the cloud broker is unreachable
//! are spooled here and drained in insertion order once the connection
//! returns. The store survives process restarts: a row is only removed after
//! the caller has confirmed the publish.
#![forbid(unsafe_code)]

use camino::Utf8Path;
use rusqlite::params;
use rusqlite::Connection;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Default number of rows returned by [`Spool::get_batch`].
pub const DEFAULT_BATCH_LIMIT: usize = 50;

/// A spooled MQTT message, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Row id; strictly increasing with insertion order.
    pub id: i64,
    pub topic: String,
    pub payload: String,
    /// Seconds since the Unix epoch at enqueue time.
    pub created_at: f64,
}

/// A spool related error
#[derive(thiserror::Error, Debug)]
pub enum SpoolError {
    #[error("Spool database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Disk-backed message queue.
///
/// All operations serialise on one internal lock; the underlying connection
/// commits with `synchronous=FULL`, so an acknowledged enqueue has reached
/// stable storage.
pub struct Spool {
    connection: Mutex<Connection>,
}

impl Spool {
    /// Open the spool at `path`, creating the database and schema on first use.
    ///
    /// A store that cannot be opened or migrated is a hard error: the caller
    /// is expected to treat it as a startup failure and let the operator
    /// remediate.
    pub fn open(path: &Utf8Path) -> Result<Spool, SpoolError> {
        let connection = Connection::open(path)?;

        // WAL keeps readers and the enqueue path from blocking each other;
        // FULL makes each commit durable before it is acknowledged.
        let _mode: String =
            connection.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        connection.pragma_update(None, "synchronous", "FULL")?;

        connection.execute(
            "CREATE TABLE IF NOT EXISTS queued_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at REAL NOT NULL
            )",
            [],
        )?;

        debug!(path = %path, "message spool opened");
        Ok(Spool {
            connection: Mutex::new(connection),
        })
    }

    /// Append a message. The new row id strictly exceeds every existing id.
    pub fn enqueue(&self, topic: &str, payload: &str) -> Result<i64, SpoolError> {
        let connection = self.connection.lock().unwrap();
        connection.execute(
            "INSERT INTO queued_messages (topic, payload, created_at) VALUES (?1, ?2, ?3)",
            params![topic, payload, unix_now()],
        )?;
        Ok(connection.last_insert_rowid())
    }

    /// The up-to-`limit` oldest messages, in ascending id order.
    ///
    /// Does not consume the rows; call [`Spool::remove`] once they have been
    /// delivered.
    pub fn get_batch(&self, limit: usize) -> Result<Vec<QueuedMessage>, SpoolError> {
        let connection = self.connection.lock().unwrap();
        let mut statement = connection.prepare(
            "SELECT id, topic, payload, created_at FROM queued_messages
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![limit as i64], |row| {
            Ok(QueuedMessage {
                id: row.get(0)?,
                topic: row.get(1)?,
                payload: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete the listed rows in one transaction.
    ///
    /// The ids are expected to come from a recent [`Spool::get_batch`];
    /// unknown ids are silently ignored and an empty list is a no-op.
    pub fn remove(&self, ids: &[i64]) -> Result<(), SpoolError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.lock().unwrap();
        let transaction = connection.transaction()?;
        {
            let mut statement =
                transaction.prepare("DELETE FROM queued_messages WHERE id = ?1")?;
            for id in ids {
                statement.execute(params![id])?;
            }
        }
        transaction.commit()?;
        Ok(())
    }

    /// Exact number of spooled messages.
    pub fn count(&self) -> Result<usize, SpoolError> {
        let connection = self.connection.lock().unwrap();
        let count: i64 =
            connection.query_row("SELECT COUNT(1) FROM queued_messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Release the backing store.
    pub fn close(self) {
        let connection = self.connection.into_inner().unwrap();
        if let Err((_, err)) = connection.close() {
            tracing::warn!(error = %err, "failed to close the message spool cleanly");
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn open_spool(dir: &TempDir) -> Spool {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("spool.db")).unwrap();
        Spool::open(&path).unwrap()
    }

    #[test]
    fn enqueue_assigns_increasing_ids() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        let first = spool.enqueue("t/1", "one")?;
        let second = spool.enqueue("t/2", "two")?;
        let third = spool.enqueue("t/1", "three")?;

        assert!(first < second && second < third);
        assert_eq!(spool.count()?, 3);
        Ok(())
    }

    #[test]
    fn batch_preserves_enqueue_order_across_topics() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        spool.enqueue("a", "1")?;
        spool.enqueue("b", "2")?;
        spool.enqueue("a", "3")?;

        let batch = spool.get_batch(DEFAULT_BATCH_LIMIT)?;
        let payloads: Vec<&str> = batch.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, ["1", "2", "3"]);
        assert!(batch.windows(2).all(|pair| pair[0].id < pair[1].id));
        Ok(())
    }

    #[test]
    fn batch_honours_the_limit_without_consuming() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        for n in 0..5 {
            spool.enqueue("t", &n.to_string())?;
        }

        assert_eq!(spool.get_batch(2)?.len(), 2);
        assert_eq!(spool.count()?, 5);
        Ok(())
    }

    #[test]
    fn enqueue_then_remove_restores_the_count() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        spool.enqueue("t", "kept")?;
        let before = spool.count()?;

        let id = spool.enqueue("t", "transient")?;
        spool.remove(&[id])?;

        assert_eq!(spool.count()?, before);
        Ok(())
    }

    #[test]
    fn remove_with_no_ids_is_a_noop() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        spool.enqueue("t", "payload")?;
        spool.remove(&[])?;

        assert_eq!(spool.count()?, 1);
        Ok(())
    }

    #[test]
    fn messages_survive_a_reopen_in_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().join("spool.db")).unwrap();

        {
            let spool = Spool::open(&path)?;
            spool.enqueue("t", "first")?;
            spool.enqueue("t", "second")?;
            spool.close();
        }

        let reopened = Spool::open(&path)?;
        let batch = reopened.get_batch(DEFAULT_BATCH_LIMIT)?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, "first");
        assert_eq!(batch[1].payload, "second");
        Ok(())
    }

    #[test]
    fn removal_is_atomic_for_the_whole_call() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let spool = open_spool(&dir);

        let a = spool.enqueue("t", "a")?;
        let b = spool.enqueue("t", "b")?;
        spool.enqueue("t", "c")?;

        spool.remove(&[a, b])?;

        let remaining = spool.get_batch(DEFAULT_BATCH_LIMIT)?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, "c");
        Ok(())
    }
}
