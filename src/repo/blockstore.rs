/// Content-addressed block storage, scoped per repo.
///
/// The sqlite store keeps an in-memory overlay of everything written through
/// it, so a `get` sees blocks from the current operation before they land in
/// a row. The recording wrapper decorates any blockstore and captures the
/// blocks a traversal touches, which is how inclusion proofs and firehose
/// diffs are assembled.
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use crate::repo::tid::Tid;
use async_trait::async_trait;
use libipld::Cid;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait Blockstore: Send + Sync {
    async fn get(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>>;
    async fn put(&self, cid: Cid, bytes: Vec<u8>) -> PdsResult<()>;
    async fn put_many(&self, blocks: Vec<(Cid, Vec<u8>)>) -> PdsResult<()>;
}

/// Blocks table backed store for one DID
pub struct SqliteBlockstore {
    db: Db,
    did: String,
    rev: Mutex<Option<String>>,
    readonly: bool,
    overlay: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl SqliteBlockstore {
    pub fn new(did: impl Into<String>, db: Db) -> Self {
        Self {
            db,
            did: did.into(),
            rev: Mutex::new(None),
            readonly: false,
            overlay: Mutex::new(HashMap::new()),
        }
    }

    /// A store that caches writes in memory but never persists them. Used
    /// for proof computation and dry runs.
    pub fn new_readonly(did: impl Into<String>, db: Db) -> Self {
        Self {
            db,
            did: did.into(),
            rev: Mutex::new(None),
            readonly: true,
            overlay: Mutex::new(HashMap::new()),
        }
    }

    /// Tag subsequent writes with a revision so blocks from one commit share
    /// a sort key.
    pub fn set_rev(&self, rev: &Tid) {
        *self.rev.lock().expect("rev lock poisoned") = Some(rev.to_string());
    }

    fn current_rev(&self) -> String {
        self.rev
            .lock()
            .expect("rev lock poisoned")
            .clone()
            .unwrap_or_else(|| crate::repo::tid::TidClock::new(0).next().to_string())
    }
}

#[async_trait]
impl Blockstore for SqliteBlockstore {
    async fn get(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        if let Some(bytes) = self.overlay.lock().expect("overlay poisoned").get(cid) {
            return Ok(Some(bytes.clone()));
        }

        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM blocks WHERE did = ? AND cid = ?")
                .bind(&self.did)
                .bind(cid.to_bytes())
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?;

        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, cid: Cid, bytes: Vec<u8>) -> PdsResult<()> {
        self.overlay
            .lock()
            .expect("overlay poisoned")
            .insert(cid, bytes.clone());

        if self.readonly {
            return Ok(());
        }

        let rev = self.current_rev();
        self.db
            .exec(
                sqlx::query(
                    "INSERT INTO blocks (did, cid, rev, value) VALUES (?, ?, ?, ?)
                     ON CONFLICT (did, cid) DO UPDATE SET rev = excluded.rev, value = excluded.value",
                )
                .bind(&self.did)
                .bind(cid.to_bytes())
                .bind(&rev)
                .bind(&bytes),
            )
            .await?;

        Ok(())
    }

    async fn put_many(&self, blocks: Vec<(Cid, Vec<u8>)>) -> PdsResult<()> {
        {
            let mut overlay = self.overlay.lock().expect("overlay poisoned");
            for (cid, bytes) in &blocks {
                overlay.insert(*cid, bytes.clone());
            }
        }

        if self.readonly {
            return Ok(());
        }

        let rev = self.current_rev();
        let mut wtx = self.db.begin().await?;
        for (cid, bytes) in &blocks {
            sqlx::query(
                "INSERT INTO blocks (did, cid, rev, value) VALUES (?, ?, ?, ?)
                 ON CONFLICT (did, cid) DO UPDATE SET rev = excluded.rev, value = excluded.value",
            )
            .bind(&self.did)
            .bind(cid.to_bytes())
            .bind(&rev)
            .bind(bytes)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        }
        wtx.commit().await?;

        Ok(())
    }
}

/// Purely in-memory store, used for tests and CAR imports
#[derive(Default)]
pub struct MemoryBlockstore {
    blocks: Mutex<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().expect("blocks poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    async fn get(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        Ok(self.blocks.lock().expect("blocks poisoned").get(cid).cloned())
    }

    async fn put(&self, cid: Cid, bytes: Vec<u8>) -> PdsResult<()> {
        self.blocks.lock().expect("blocks poisoned").insert(cid, bytes);
        Ok(())
    }

    async fn put_many(&self, blocks: Vec<(Cid, Vec<u8>)>) -> PdsResult<()> {
        let mut map = self.blocks.lock().expect("blocks poisoned");
        for (cid, bytes) in blocks {
            map.insert(cid, bytes);
        }
        Ok(())
    }
}

/// Decorator that logs every block read and written through it, in order.
pub struct RecordingBlockstore<'a> {
    inner: &'a dyn Blockstore,
    read_log: Mutex<Vec<(Cid, Vec<u8>)>>,
    write_log: Mutex<Vec<(Cid, Vec<u8>)>>,
}

impl<'a> RecordingBlockstore<'a> {
    pub fn new(inner: &'a dyn Blockstore) -> Self {
        Self {
            inner,
            read_log: Mutex::new(Vec::new()),
            write_log: Mutex::new(Vec::new()),
        }
    }

    /// Blocks read so far, first touch first. Duplicate reads collapse.
    pub fn read_log(&self) -> Vec<(Cid, Vec<u8>)> {
        dedup(self.read_log.lock().expect("read log poisoned").clone())
    }

    /// Blocks written so far, first write first
    pub fn write_log(&self) -> Vec<(Cid, Vec<u8>)> {
        dedup(self.write_log.lock().expect("write log poisoned").clone())
    }
}

fn dedup(log: Vec<(Cid, Vec<u8>)>) -> Vec<(Cid, Vec<u8>)> {
    let mut seen = std::collections::HashSet::new();
    log.into_iter().filter(|(cid, _)| seen.insert(*cid)).collect()
}

#[async_trait]
impl Blockstore for RecordingBlockstore<'_> {
    async fn get(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        let result = self.inner.get(cid).await?;
        if let Some(bytes) = &result {
            self.read_log
                .lock()
                .expect("read log poisoned")
                .push((*cid, bytes.clone()));
        }
        Ok(result)
    }

    async fn put(&self, cid: Cid, bytes: Vec<u8>) -> PdsResult<()> {
        self.write_log
            .lock()
            .expect("write log poisoned")
            .push((cid, bytes.clone()));
        self.inner.put(cid, bytes).await
    }

    async fn put_many(&self, blocks: Vec<(Cid, Vec<u8>)>) -> PdsResult<()> {
        {
            let mut log = self.write_log.lock().expect("write log poisoned");
            for (cid, bytes) in &blocks {
                log.push((*cid, bytes.clone()));
            }
        }
        self.inner.put_many(blocks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::data::{cid_for, CODEC_RAW};

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let bs = MemoryBlockstore::new();
        let cid = cid_for(CODEC_RAW, b"hello");
        bs.put(cid, b"hello".to_vec()).await.unwrap();
        assert_eq!(bs.get(&cid).await.unwrap(), Some(b"hello".to_vec()));

        let missing = cid_for(CODEC_RAW, b"other");
        assert_eq!(bs.get(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recording_store_captures_reads_and_writes() {
        let inner = MemoryBlockstore::new();
        let a = cid_for(CODEC_RAW, b"a");
        inner.put(a, b"a".to_vec()).await.unwrap();

        let recording = RecordingBlockstore::new(&inner);
        recording.get(&a).await.unwrap();
        recording.get(&a).await.unwrap();

        let b = cid_for(CODEC_RAW, b"b");
        recording.put(b, b"b".to_vec()).await.unwrap();

        assert_eq!(recording.read_log(), vec![(a, b"a".to_vec())]);
        assert_eq!(recording.write_log(), vec![(b, b"b".to_vec())]);

        // the write went through to the inner store
        assert_eq!(inner.get(&b).await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_sqlite_store_overlay_serves_unflushed_reads() {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let db = Db::new(pool);

        let bs = SqliteBlockstore::new_readonly("did:plc:tester", db.clone());
        let cid = cid_for(CODEC_RAW, b"buffered");
        bs.put(cid, b"buffered".to_vec()).await.unwrap();

        // visible through the overlay
        assert_eq!(bs.get(&cid).await.unwrap(), Some(b"buffered".to_vec()));

        // but never persisted
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocks")
            .fetch_one(db.reader())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_with_rev_tag() {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let db = Db::new(pool);

        let bs = SqliteBlockstore::new("did:plc:tester", db.clone());
        bs.set_rev(&crate::repo::tid::Tid::from_time(1_700_000_000_000_000, 0));

        let cid = cid_for(CODEC_RAW, b"persisted");
        bs.put(cid, b"persisted".to_vec()).await.unwrap();

        let row: (Vec<u8>, String) =
            sqlx::query_as("SELECT value, rev FROM blocks WHERE did = ? AND cid = ?")
                .bind("did:plc:tester")
                .bind(cid.to_bytes())
                .fetch_one(db.reader())
                .await
                .unwrap();
        assert_eq!(row.0, b"persisted".to_vec());
        assert!(!row.1.is_empty());
    }
}
