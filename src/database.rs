pub use tokio_postgres::Client;
pub use uuid::Uuid;

use crate::{
    error::Result,
    storage::{BlobStore, Delivery, Queue},
};

use core::time::Duration;
use tokio::time::Instant;

/// Tables backing the blob store and the notification queue.
pub const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS blob (\
        bucket TEXT NOT NULL, \
        key TEXT NOT NULL, \
        data BYTEA NOT NULL, \
        PRIMARY KEY (bucket, key)\
    ); \
    CREATE TABLE IF NOT EXISTS message (\
        id BIGSERIAL PRIMARY KEY, \
        queue TEXT NOT NULL, \
        body TEXT NOT NULL, \
        visible_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
        receipt UUID\
    ); \
    CREATE INDEX IF NOT EXISTS message_visible ON message (queue, visible_at);";

/// How often an empty long-poll re-checks the queue.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct Database {
    db: Client,
    visibility: Duration,
}

impl From<Client> for Database {
    fn from(db: Client) -> Self {
        Self { db, visibility: Duration::from_secs(120) }
    }
}

impl Database {
    /// Sets how long a received message stays hidden before it is redelivered.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    /// Creates the tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        self.db.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Claims up to `max` visible messages, hiding them for the visibility timeout and
    /// stamping each with a fresh receipt. Concurrent consumers never claim the same row.
    async fn claim(&self, queue: &str, max: i64) -> Result<Vec<Delivery>> {
        let secs = self.visibility.as_secs_f64();
        let rows = self
            .db
            .query(
                "WITH claimed AS (\
                    UPDATE message SET visible_at = now() + make_interval(secs => $3), receipt = gen_random_uuid() \
                    WHERE id IN (SELECT id FROM message WHERE queue = $1 AND visible_at <= now() \
                    ORDER BY id LIMIT $2 FOR UPDATE SKIP LOCKED) RETURNING id, body, receipt\
                ) SELECT body, receipt FROM claimed ORDER BY id",
                &[&queue, &max, &secs],
            )
            .await?;

        let deliveries = rows
            .into_iter()
            .map(|row| {
                let receipt: Uuid = row.get(1);
                Delivery { body: row.get(0), receipt: receipt.simple().to_string() }
            })
            .collect();
        Ok(deliveries)
    }
}

impl Queue for Database {
    async fn receive(&self, queue: &str, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let max = i64::try_from(max).unwrap_or(i64::MAX);
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.claim(queue, max).await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn ack(&self, queue: &str, receipt: &str) -> Result<()> {
        let Ok(receipt) = Uuid::parse_str(receipt) else {
            log::warn!("ignoring malformed receipt {receipt}");
            return Ok(());
        };
        self.db.execute("DELETE FROM message WHERE queue = $1 AND receipt = $2", &[&queue, &receipt]).await?;
        Ok(())
    }

    async fn send(&self, queue: &str, body: String) -> Result<()> {
        self.db.execute("INSERT INTO message (queue, body) VALUES ($1, $2)", &[&queue, &body]).await?;
        Ok(())
    }
}

impl BlobStore for Database {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row = self.db.query_opt("SELECT data FROM blob WHERE bucket = $1 AND key = $2", &[&bucket, &key]).await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO blob (bucket, key, data) VALUES ($1, $2, $3) \
                ON CONFLICT (bucket, key) DO UPDATE SET data = EXCLUDED.data",
                &[&bucket, &key, &bytes],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.db.execute("DELETE FROM blob WHERE bucket = $1 AND key = $2", &[&bucket, &key]).await?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let rows = self
            .db
            .query(
                "SELECT key FROM blob WHERE bucket = $1 AND starts_with(key, $2) ORDER BY key",
                &[&bucket, &prefix],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let row = self
            .db
            .query_one("SELECT EXISTS (SELECT 1 FROM blob WHERE bucket = $1 AND key = $2)", &[&bucket, &key])
            .await?;
        Ok(row.get(0))
    }
}
