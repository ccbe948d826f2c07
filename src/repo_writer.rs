/// The write coordinator.
///
/// Turns a batch of record operations into: a new signed commit, updated
/// record-index rows, blob refcount deltas, and one `#commit` firehose
/// event. Writers for the same DID are serialized by a per-DID async lock;
/// `swapCommit` adds CAS on top for callers that want optimistic retries.
///
/// Ordering of effects: record rows, refcounts and the repo head move in a
/// single gateway transaction; the event is persisted after that commits.
/// If event persistence fails the head stays moved — the next commit's
/// `since` lets consumers re-derive the missed diff.
use crate::account::AccountManager;
use crate::blob::{BlobCleanup, BlobStore};
use crate::db::Db;
use crate::error::{PdsError, PdsResult};
use crate::metrics;
use crate::models::{Record, RepoActor};
use crate::repo::blockstore::{Blockstore, RecordingBlockstore, SqliteBlockstore};
use crate::repo::car::CarWriter;
use crate::repo::data::{decode_dag_cbor, extract_blob_cids, normalize_record};
use crate::repo::mst::DiffKind;
use crate::repo::tid::{Tid, TidClock};
use crate::repo::Repository;
use crate::sequencer::{CommitEvt, CommitOp, Sequencer};
use libipld::Cid;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl WriteAction {
    fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }
}

/// One requested operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOp {
    pub action: WriteAction,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Expected CID of the record being replaced/deleted (per-record CAS)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_record: Option<String>,
}

/// Outcome of one operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub action: WriteAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Outcome of the whole batch
#[derive(Debug, Clone)]
pub struct ApplyWritesOutcome {
    pub results: Vec<WriteResult>,
    pub commit_cid: Cid,
    pub rev: Tid,
}

/// What happened to one record, carried from the MST stage to the indexing
/// stage. Deletes and updates remember the displaced value so refcounts can
/// settle correctly.
enum RecordOp {
    Create(Record),
    Update { row: Record, old_value: Vec<u8> },
    Delete { row: Record },
}

pub struct RepoWriter {
    db: Db,
    sequencer: Arc<Sequencer>,
    blob_store: Arc<BlobStore>,
    clock: TidClock,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoWriter {
    pub fn new(db: Db, sequencer: Arc<Sequencer>, blob_store: Arc<BlobStore>) -> Self {
        Self {
            db,
            sequencer,
            blob_store,
            clock: TidClock::new(3),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, did: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(did.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Apply a batch of writes to one repo.
    pub async fn apply_writes(
        &self,
        account: &RepoActor,
        mut writes: Vec<WriteOp>,
        swap_commit: Option<Cid>,
    ) -> PdsResult<ApplyWritesOutcome> {
        if writes.is_empty() {
            return Err(PdsError::InvalidRequest("no writes supplied".to_string()));
        }

        let did = account.repo.did.clone();
        let lock = self.lock_for(&did).await;
        let _guard = lock.lock().await;

        // reload the head under the lock; the caller's copy may be stale
        let (root_bytes, old_rev): (Vec<u8>, String) =
            sqlx::query_as("SELECT root, rev FROM repos WHERE did = ?")
                .bind(&did)
                .fetch_optional(self.db.reader())
                .await
                .map_err(PdsError::Database)?
                .ok_or_else(|| PdsError::RepoNotFound(did.clone()))?;
        let old_root = Cid::try_from(root_bytes.as_slice())
            .map_err(|e| PdsError::Repo(format!("stored root is invalid: {}", e)))?;

        if let Some(expected) = swap_commit {
            if expected != old_root {
                return Err(PdsError::InvalidRequest(
                    "swapCommit did not match the current head".to_string(),
                ));
            }
        }

        let signing_key = AccountManager::signing_key(&account.repo)?;

        let dbs = SqliteBlockstore::new(did.clone(), self.db.clone());
        let bs = RecordingBlockstore::new(&dbs);
        let mut repo = Repository::open(&bs, old_root).await?;

        let rev = self.clock.next();
        dbs.set_rev(&rev);

        let mut entries: Vec<RecordOp> = Vec::with_capacity(writes.len());
        let mut results: Vec<WriteResult> = Vec::with_capacity(writes.len());

        for op in writes.iter_mut() {
            // creates mint an rkey when none is given; anything else needs one
            if op.rkey.is_none() {
                if op.action == WriteAction::Create {
                    op.rkey = Some(self.clock.next().to_string());
                } else {
                    return Err(PdsError::InvalidRequest("rkey is required".to_string()));
                }
            }
            let rkey = op.rkey.clone().expect("rkey just ensured");
            validate_rkey(&rkey)?;

            let path = format!("{}/{}", op.collection, rkey);

            // a create aimed at an occupied path is really an update
            let mut action = op.action;
            if action == WriteAction::Create && repo.contains(&path) {
                action = WriteAction::Update;
            }

            if let Some(expected) = &op.swap_record {
                let current = repo
                    .get_record_bytes(&path)
                    .await?
                    .map(|(cid, _)| cid.to_string());
                if current.as_deref() != Some(expected.as_str()) {
                    return Err(PdsError::InvalidRequest(format!(
                        "swapRecord mismatch on {}",
                        path
                    )));
                }
            }

            match action {
                WriteAction::Create | WriteAction::Update => {
                    let value = op.value.as_ref().ok_or_else(|| {
                        PdsError::InvalidRequest("create/update requires a record".to_string())
                    })?;
                    let record = normalize_record(&op.collection, value)?;

                    let old_value = if action == WriteAction::Update {
                        Some(
                            repo.get_record_bytes(&path)
                                .await?
                                .map(|(_, bytes)| bytes)
                                .unwrap_or_default(),
                        )
                    } else {
                        None
                    };

                    let cid = if action == WriteAction::Update {
                        repo.update_record(&path, &record).await?
                    } else {
                        repo.put_record(&path, &record).await?
                    };
                    let value_bytes = bs
                        .get(&cid)
                        .await?
                        .ok_or_else(|| PdsError::Repo("freshly written block missing".to_string()))?;

                    let row = Record {
                        did: did.clone(),
                        nsid: op.collection.clone(),
                        rkey: rkey.clone(),
                        cid: cid.to_string(),
                        created_at: self.clock.next().to_string(),
                        value: value_bytes,
                    };
                    entries.push(match old_value {
                        Some(old_value) => RecordOp::Update { row, old_value },
                        None => RecordOp::Create(row),
                    });
                    results.push(WriteResult {
                        action,
                        uri: Some(format!("at://{}/{}/{}", did, op.collection, rkey)),
                        cid: Some(cid.to_string()),
                    });
                }
                WriteAction::Delete => {
                    let old: Option<Record> = sqlx::query_as(
                        "SELECT * FROM records WHERE did = ? AND nsid = ? AND rkey = ?",
                    )
                    .bind(&did)
                    .bind(&op.collection)
                    .bind(&rkey)
                    .fetch_optional(self.db.reader())
                    .await
                    .map_err(PdsError::Database)?;
                    let old = old.ok_or_else(|| PdsError::RecordNotFound(path.clone()))?;

                    repo.delete_record(&path)?;
                    entries.push(RecordOp::Delete { row: old });
                    results.push(WriteResult {
                        action,
                        uri: None,
                        cid: None,
                    });
                }
            }
        }

        let (commit_cid, rev) = repo
            .commit(rev, |bytes| Ok(signing_key.hash_and_sign(bytes)))
            .await?;

        for result in &results {
            metrics::REPO_OPERATIONS
                .with_label_values(&[result.action.as_str()])
                .inc();
        }

        // CAR delta: diff blocks plus everything written this pass
        let diff = repo.diff_since(Some(old_root)).await?;
        let mut car = CarWriter::new(&[commit_cid])?;
        let mut car_cids: HashSet<Cid> = HashSet::new();
        let mut ops: Vec<CommitOp> = Vec::with_capacity(diff.len());

        for entry in &diff {
            match entry.kind {
                DiffKind::Add | DiffKind::Mut => {
                    let cid = entry.new_cid.expect("add/mut carries a new cid");
                    ops.push(CommitOp {
                        action: if entry.kind == DiffKind::Add {
                            "create".to_string()
                        } else {
                            "update".to_string()
                        },
                        path: entry.path.clone(),
                        cid: Some(cid.to_string()),
                        prev: None,
                    });
                    if car_cids.insert(cid) {
                        let bytes = bs.get(&cid).await?.ok_or_else(|| {
                            PdsError::Repo(format!("diff block {} missing", cid))
                        })?;
                        car.write_block(&cid, &bytes);
                    }
                }
                DiffKind::Del => {
                    let old_cid = entry.old_cid.expect("del carries the old cid");
                    ops.push(CommitOp {
                        action: "delete".to_string(),
                        path: entry.path.clone(),
                        cid: None,
                        prev: Some(old_cid.to_string()),
                    });
                }
            }
        }
        for (cid, bytes) in bs.write_log() {
            if car_cids.insert(cid) {
                car.write_block(&cid, &bytes);
            }
        }

        // blob accounting: settle the delta per entry, count each CID once
        // per record
        let mut blob_cids: Vec<Cid> = Vec::new();
        let mut increments: Vec<(Cid, i64)> = Vec::new();
        let mut tally = |cids: Vec<Cid>, delta: i64, report: &mut Vec<Cid>| {
            for cid in cids {
                if delta > 0 && !report.contains(&cid) {
                    report.push(cid);
                }
                increments.push((cid, delta));
            }
        };
        for entry in &entries {
            match entry {
                RecordOp::Create(row) => {
                    tally(blob_refs(&row.value)?, 1, &mut blob_cids);
                }
                RecordOp::Update { row, old_value } => {
                    tally(blob_refs(old_value)?, -1, &mut blob_cids);
                    tally(blob_refs(&row.value)?, 1, &mut blob_cids);
                }
                RecordOp::Delete { row } => {
                    tally(blob_refs(&row.value)?, -1, &mut blob_cids);
                }
            }
        }

        // records, refcounts and the head move or none of them do
        let mut cleanups: Vec<BlobCleanup> = Vec::new();
        {
            let mut wtx = self.db.begin().await?;

            for entry in &entries {
                match entry {
                    RecordOp::Create(row) | RecordOp::Update { row, .. } => {
                        sqlx::query(
                            "INSERT INTO records (did, nsid, rkey, cid, created_at, value)
                             VALUES (?, ?, ?, ?, ?, ?)
                             ON CONFLICT (did, nsid, rkey) DO UPDATE SET
                               cid = excluded.cid, created_at = excluded.created_at,
                               value = excluded.value",
                        )
                        .bind(&row.did)
                        .bind(&row.nsid)
                        .bind(&row.rkey)
                        .bind(&row.cid)
                        .bind(&row.created_at)
                        .bind(&row.value)
                        .execute(&mut *wtx.tx)
                        .await
                        .map_err(PdsError::Database)?;
                    }
                    RecordOp::Delete { row } => {
                        sqlx::query("DELETE FROM records WHERE did = ? AND nsid = ? AND rkey = ?")
                            .bind(&row.did)
                            .bind(&row.nsid)
                            .bind(&row.rkey)
                            .execute(&mut *wtx.tx)
                            .await
                            .map_err(PdsError::Database)?;
                    }
                }
            }

            for (cid, delta) in &increments {
                if *delta > 0 {
                    BlobStore::increment_refs_tx(&mut wtx.tx, &did, &[*cid]).await?;
                } else {
                    cleanups
                        .extend(BlobStore::decrement_refs_tx(&mut wtx.tx, &did, &[*cid]).await?);
                }
            }

            sqlx::query("UPDATE repos SET root = ?, rev = ? WHERE did = ?")
                .bind(commit_cid.to_bytes())
                .bind(rev.to_string())
                .bind(&did)
                .execute(&mut *wtx.tx)
                .await
                .map_err(PdsError::Database)?;

            wtx.commit().await?;
        }

        self.blob_store.run_cleanups(cleanups).await;

        // durable-then-visible: the commit is already in place, so a failed
        // event persist only logs; the next event's `since` spans the gap
        let event = CommitEvt {
            seq: 0,
            rebase: false,
            too_big: false,
            repo: did.clone(),
            commit: commit_cid.to_string(),
            rev: rev.to_string(),
            since: Some(old_rev),
            blocks: car.into_bytes(),
            ops,
            blobs: blob_cids.iter().map(|c| c.to_string()).collect(),
            time: String::new(),
        };
        if let Err(e) = self.sequencer.sequence_commit(event).await {
            tracing::warn!(did = %did, "commit event persistence failed: {}", e);
        }

        Ok(ApplyWritesOutcome {
            results,
            commit_cid,
            rev,
        })
    }

    /// createRecord: one create, rkey optional
    pub async fn create_record(
        &self,
        account: &RepoActor,
        collection: &str,
        rkey: Option<String>,
        value: serde_json::Value,
        swap_commit: Option<Cid>,
    ) -> PdsResult<(WriteResult, ApplyWritesOutcome)> {
        let outcome = self
            .apply_writes(
                account,
                vec![WriteOp {
                    action: WriteAction::Create,
                    collection: collection.to_string(),
                    rkey,
                    value: Some(value),
                    swap_record: None,
                }],
                swap_commit,
            )
            .await?;
        Ok((outcome.results[0].clone(), outcome))
    }

    /// putRecord: create-or-replace at a fixed rkey
    pub async fn put_record(
        &self,
        account: &RepoActor,
        collection: &str,
        rkey: &str,
        value: serde_json::Value,
        swap_record: Option<String>,
        swap_commit: Option<Cid>,
    ) -> PdsResult<(WriteResult, ApplyWritesOutcome)> {
        let outcome = self
            .apply_writes(
                account,
                vec![WriteOp {
                    action: WriteAction::Create,
                    collection: collection.to_string(),
                    rkey: Some(rkey.to_string()),
                    value: Some(value),
                    swap_record,
                }],
                swap_commit,
            )
            .await?;
        Ok((outcome.results[0].clone(), outcome))
    }

    /// deleteRecord
    pub async fn delete_record(
        &self,
        account: &RepoActor,
        collection: &str,
        rkey: &str,
        swap_record: Option<String>,
        swap_commit: Option<Cid>,
    ) -> PdsResult<ApplyWritesOutcome> {
        self.apply_writes(
            account,
            vec![WriteOp {
                action: WriteAction::Delete,
                collection: collection.to_string(),
                rkey: Some(rkey.to_string()),
                value: None,
                swap_record,
            }],
            swap_commit,
        )
        .await
    }

    /// Inclusion proof for sync.getRecord: the commit block plus every block
    /// read while resolving the path.
    pub async fn get_record_proof(
        &self,
        account: &RepoActor,
        collection: &str,
        rkey: &str,
    ) -> PdsResult<(Cid, Vec<(Cid, Vec<u8>)>)> {
        let root = Cid::try_from(account.repo.root.as_slice())
            .map_err(|e| PdsError::Repo(format!("stored root is invalid: {}", e)))?;

        let dbs = SqliteBlockstore::new_readonly(account.repo.did.clone(), self.db.clone());
        let bs = RecordingBlockstore::new(&dbs);

        let found = crate::repo::prove_record(&bs, &root, &format!("{}/{}", collection, rkey)).await?;
        if found.is_none() {
            return Err(PdsError::RecordNotFound(format!("{}/{}", collection, rkey)));
        }

        Ok((root, bs.read_log()))
    }

    /// Replace a repo's contents from an uploaded CAR. Blocks are stored
    /// verbatim and the head is pointed at the CAR root, so a round-trip
    /// through getRepo reproduces the same root CID.
    pub async fn import_repo(&self, account: &RepoActor, car_bytes: &[u8]) -> PdsResult<Cid> {
        let did = account.repo.did.clone();
        let lock = self.lock_for(&did).await;
        let _guard = lock.lock().await;

        let car = crate::repo::car::decode_car(car_bytes)?;
        let root = *car
            .roots
            .first()
            .ok_or_else(|| PdsError::InvalidRequest("car has no root".to_string()))?;

        // stage in memory and make sure the tree is complete before touching rows
        let staging = crate::repo::blockstore::MemoryBlockstore::new();
        staging.put_many(car.blocks.clone()).await?;
        let imported = Repository::open(&staging, root).await?;
        let rev = imported
            .rev()
            .ok_or_else(|| PdsError::InvalidRequest("car root has no rev".to_string()))?
            .to_string();

        let dbs = SqliteBlockstore::new(did.clone(), self.db.clone());
        if let Some(parsed) = Tid::parse(&rev) {
            dbs.set_rev(&parsed);
        }
        dbs.put_many(car.blocks).await?;

        let mut records: Vec<Record> = Vec::new();
        for (path, cid) in imported_records(&imported) {
            let bytes = staging
                .get(&cid)
                .await?
                .ok_or_else(|| PdsError::InvalidRequest(format!("car missing block for {}", path)))?;
            let (nsid, rkey) = path
                .split_once('/')
                .ok_or_else(|| PdsError::InvalidRequest(format!("bad record path {}", path)))?;
            records.push(Record {
                did: did.clone(),
                nsid: nsid.to_string(),
                rkey: rkey.to_string(),
                cid: cid.to_string(),
                created_at: self.clock.next().to_string(),
                value: bytes,
            });
        }

        let mut wtx = self.db.begin().await?;
        sqlx::query("DELETE FROM records WHERE did = ?")
            .bind(&did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        for row in &records {
            sqlx::query(
                "INSERT INTO records (did, nsid, rkey, cid, created_at, value)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.did)
            .bind(&row.nsid)
            .bind(&row.rkey)
            .bind(&row.cid)
            .bind(&row.created_at)
            .bind(&row.value)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        }
        sqlx::query("UPDATE repos SET root = ?, rev = ? WHERE did = ?")
            .bind(root.to_bytes())
            .bind(&rev)
            .bind(&did)
            .execute(&mut *wtx.tx)
            .await
            .map_err(PdsError::Database)?;
        wtx.commit().await?;

        Ok(root)
    }
}

fn imported_records(repo: &Repository<'_>) -> Vec<(String, Cid)> {
    let mut out = Vec::new();
    repo.for_each("", |path, cid| out.push((path.to_string(), *cid)));
    out
}

fn blob_refs(record_cbor: &[u8]) -> PdsResult<Vec<Cid>> {
    if record_cbor.is_empty() {
        return Ok(Vec::new());
    }
    Ok(extract_blob_cids(&decode_dag_cbor(record_cbor)?))
}

/// rkeys: 1..512 chars of [A-Za-z0-9._:~-]
fn validate_rkey(rkey: &str) -> PdsResult<()> {
    if rkey.is_empty() || rkey.len() > 512 || rkey == "." || rkey == ".." {
        return Err(PdsError::InvalidRequest(format!("invalid rkey: {}", rkey)));
    }
    if !rkey
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'))
    {
        return Err(PdsError::InvalidRequest(format!("invalid rkey: {}", rkey)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::manager::CreateAccountParams;
    use crate::config::ServerConfig;
    use crate::sequencer::frames::{decode_event_frame, SeqEvent};
    use crate::sequencer::{DbPersister, SequencerConfig};

    pub struct Harness {
        pub db: Db,
        pub accounts: AccountManager,
        pub writer: RepoWriter,
        pub sequencer: Arc<Sequencer>,
        pub blobs: Arc<BlobStore>,
    }

    pub async fn harness() -> Harness {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let db = Db::new(pool);

        let persister = DbPersister::new(db.clone()).await.unwrap();
        let sequencer = Arc::new(Sequencer::new(persister, SequencerConfig::default()));
        let blobs = Arc::new(BlobStore::new(db.clone(), None));

        let mut config: ServerConfig = test_config();
        config.invites.required = false;
        let accounts = AccountManager::new(db.clone(), Arc::new(config), Arc::clone(&sequencer));
        let writer = RepoWriter::new(db.clone(), Arc::clone(&sequencer), Arc::clone(&blobs));

        Harness {
            db,
            accounts,
            writer,
            sequencer,
            blobs,
        }
    }

    fn test_config() -> ServerConfig {
        use crate::config::*;
        ServerConfig {
            service: ServiceConfig {
                hostname: "pds.example.com".to_string(),
                port: 2583,
                did: "did:web:pds.example.com".to_string(),
                version: "test".to_string(),
                contact_email: None,
                admin_password: "admin".to_string(),
                session_secret: "0123456789abcdef0123456789abcdef".to_string(),
                blob_upload_limit: 5_242_880,
            },
            storage: StorageConfig {
                data_directory: "./data".into(),
                db_path: "./data/pds.sqlite".into(),
                nonce_secret_path: "./data/nonce.secret".into(),
            },
            keys: KeyConfig {
                rotation_key_path: "./data/rotation.key".into(),
                jwk_path: "./data/server.jwk".into(),
            },
            invites: InviteConfig { required: false },
            smtp: None,
            s3: None,
            relays: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }

    async fn make_account(h: &Harness, handle: &str, email: &str) -> RepoActor {
        h.accounts
            .create_account(CreateAccountParams {
                handle: handle.to_string(),
                email: email.to_string(),
                password: "hunter22".to_string(),
                invite_code: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_delete_record() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;
        let seq_start = h.sequencer.persister().current_seq().await;

        let (result, outcome) = h
            .writer
            .create_record(
                &account,
                "app.bsky.feed.post",
                None,
                serde_json::json!({"text": "hi"}),
                None,
            )
            .await
            .unwrap();
        let uri = result.uri.clone().unwrap();
        assert!(uri.starts_with(&format!("at://{}/app.bsky.feed.post/", account.repo.did)));
        let rkey = uri.rsplit('/').next().unwrap().to_string();

        // the index row exists and the head moved
        let row: (String,) = sqlx::query_as("SELECT cid FROM records WHERE did = ? AND rkey = ?")
            .bind(&account.repo.did)
            .bind(&rkey)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(Some(row.0), result.cid);

        let (root_bytes, rev): (Vec<u8>, String) =
            sqlx::query_as("SELECT root, rev FROM repos WHERE did = ?")
                .bind(&account.repo.did)
                .fetch_one(h.db.reader())
                .await
                .unwrap();
        assert_eq!(Cid::try_from(root_bytes.as_slice()).unwrap(), outcome.commit_cid);
        assert_eq!(rev, outcome.rev.to_string());

        // one #commit event with a create op
        let evt = nth_event(&h, seq_start + 1).await;
        let SeqEvent::Commit(commit) = evt else { panic!("expected commit") };
        assert_eq!(commit.ops.len(), 1);
        assert_eq!(commit.ops[0].action, "create");
        assert_eq!(commit.commit, outcome.commit_cid.to_string());
        assert!(!commit.blocks.is_empty());

        // delete it
        let account = h.accounts.get_repo_actor_by_did(&account.repo.did).await.unwrap();
        h.writer
            .delete_record(&account, "app.bsky.feed.post", &rkey, None, None)
            .await
            .unwrap();

        let evt = nth_event(&h, seq_start + 2).await;
        let SeqEvent::Commit(commit) = evt else { panic!("expected commit") };
        assert_eq!(commit.ops[0].action, "delete");
        assert_eq!(commit.ops[0].cid, None);
        assert!(commit.ops[0].prev.is_some());

        let gone: Option<(String,)> =
            sqlx::query_as("SELECT cid FROM records WHERE did = ? AND rkey = ?")
                .bind(&account.repo.did)
                .bind(&rkey)
                .fetch_optional(h.db.reader())
                .await
                .unwrap();
        assert!(gone.is_none());
    }

    async fn nth_event(h: &Harness, seq: i64) -> SeqEvent {
        let mut found = None;
        h.sequencer
            .persister()
            .playback(seq - 1, |evt| {
                if evt.seq == seq && found.is_none() {
                    found = Some(decode_event_frame(&evt.frame).unwrap());
                }
                Ok(())
            })
            .await
            .unwrap();
        found.expect("event not found")
    }

    #[tokio::test]
    async fn test_create_with_existing_rkey_becomes_update() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;

        h.writer
            .put_record(
                &account,
                "app.bsky.actor.profile",
                "self",
                serde_json::json!({"displayName": "Alice"}),
                None,
                None,
            )
            .await
            .unwrap();

        let account = h.accounts.get_repo_actor_by_did(&account.repo.did).await.unwrap();
        let (result, _) = h
            .writer
            .put_record(
                &account,
                "app.bsky.actor.profile",
                "self",
                serde_json::json!({"displayName": "Alice v2"}),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.action, WriteAction::Update);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE did = ?")
            .bind(&account.repo.did)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_swap_commit_mismatch_aborts_cleanly() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;

        let bogus = crate::repo::data::cid_for(crate::repo::data::CODEC_DAG_CBOR, b"other head");
        let err = h
            .writer
            .create_record(
                &account,
                "app.bsky.feed.post",
                None,
                serde_json::json!({"text": "never lands"}),
                Some(bogus),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));

        // nothing changed
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE did = ?")
            .bind(&account.repo.did)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        let (rev,): (String,) = sqlx::query_as("SELECT rev FROM repos WHERE did = ?")
            .bind(&account.repo.did)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(rev, account.repo.rev);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;
        let seq_before = h.sequencer.persister().current_seq().await;

        // second op deletes a record that does not exist: whole batch dies
        let err = h
            .writer
            .apply_writes(
                &account,
                vec![
                    WriteOp {
                        action: WriteAction::Create,
                        collection: "app.bsky.feed.post".to_string(),
                        rkey: None,
                        value: Some(serde_json::json!({"text": "doomed"})),
                        swap_record: None,
                    },
                    WriteOp {
                        action: WriteAction::Delete,
                        collection: "app.bsky.feed.post".to_string(),
                        rkey: Some("missing".to_string()),
                        value: None,
                        swap_record: None,
                    },
                ],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::RecordNotFound(_)));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE did = ?")
            .bind(&account.repo.did)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        assert_eq!(h.sequencer.persister().current_seq().await, seq_before);
    }

    #[tokio::test]
    async fn test_blob_refcounts_follow_records() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;

        let uploaded = h.blobs.upload(&account.repo.did, b"image bytes").await.unwrap();
        let record = serde_json::json!({
            "text": "with image",
            "embed": {
                "images": [
                    {"image": {"$type": "blob", "ref": {"$link": uploaded.cid.to_string()}, "mimeType": "image/png", "size": 11}},
                    {"image": {"$type": "blob", "ref": {"$link": uploaded.cid.to_string()}, "mimeType": "image/png", "size": 11}},
                ],
            },
        });

        let (result, _) = h
            .writer
            .create_record(&account, "app.bsky.feed.post", None, record, None)
            .await
            .unwrap();
        // two references in the record, one unique CID: counted once
        assert_eq!(
            h.blobs.ref_count(&account.repo.did, &uploaded.cid).await.unwrap(),
            Some(1)
        );

        let rkey = result.uri.unwrap().rsplit('/').next().unwrap().to_string();
        let account = h.accounts.get_repo_actor_by_did(&account.repo.did).await.unwrap();
        h.writer
            .delete_record(&account, "app.bsky.feed.post", &rkey, None, None)
            .await
            .unwrap();

        // refcount hit zero: row and parts destroyed
        assert_eq!(
            h.blobs.ref_count(&account.repo.did, &uploaded.cid).await.unwrap(),
            None
        );
        assert_eq!(
            h.blobs.get_bytes(&account.repo.did, &uploaded.cid).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_record_round_trip_preserves_cbor() {
        let h = harness().await;
        let account = make_account(&h, "alice.pds.example.com", "alice@example.com").await;

        let value = serde_json::json!({"text": "hello", "langs": ["en"], "count": 12345678901i64});
        let (result, _) = h
            .writer
            .create_record(&account, "app.bsky.feed.post", Some("aaaaaaaaaaaaa".to_string()), value, None)
            .await
            .unwrap();

        let (stored,): (Vec<u8>,) =
            sqlx::query_as("SELECT value FROM records WHERE did = ? AND rkey = 'aaaaaaaaaaaaa'")
                .bind(&account.repo.did)
                .fetch_one(h.db.reader())
                .await
                .unwrap();

        // the MST's copy is byte-identical to the index row
        let account = h.accounts.get_repo_actor_by_did(&account.repo.did).await.unwrap();
        let dbs = SqliteBlockstore::new(account.repo.did.clone(), h.db.clone());
        let root = Cid::try_from(account.repo.root.as_slice()).unwrap();
        let repo = Repository::open(&dbs, root).await.unwrap();
        let (cid, bytes) = repo
            .get_record_bytes("app.bsky.feed.post/aaaaaaaaaaaaa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, stored);
        assert_eq!(Some(cid.to_string()), result.cid);
    }

    #[tokio::test]
    async fn test_export_import_round_trip_keeps_root() {
        let h = harness().await;
        let alice = make_account(&h, "alice.pds.example.com", "alice@example.com").await;

        for i in 0..5 {
            let account = h.accounts.get_repo_actor_by_did(&alice.repo.did).await.unwrap();
            h.writer
                .create_record(
                    &account,
                    "app.bsky.feed.post",
                    None,
                    serde_json::json!({"text": format!("post {}", i)}),
                    None,
                )
                .await
                .unwrap();
        }

        let alice = h.accounts.get_repo_actor_by_did(&alice.repo.did).await.unwrap();
        let root = Cid::try_from(alice.repo.root.as_slice()).unwrap();
        let dbs = SqliteBlockstore::new(alice.repo.did.clone(), h.db.clone());
        let blocks = crate::repo::export_blocks(&dbs, &root).await.unwrap();
        let mut car = CarWriter::new(&[root]).unwrap();
        car.write_blocks(blocks.iter());
        let car_bytes = car.into_bytes();

        // import into a second account on the same server
        let bob = make_account(&h, "bob.pds.example.com", "bob@example.com").await;
        let imported_root = h.writer.import_repo(&bob, &car_bytes).await.unwrap();
        assert_eq!(imported_root, root);

        let bob = h.accounts.get_repo_actor_by_did(&bob.repo.did).await.unwrap();
        assert_eq!(Cid::try_from(bob.repo.root.as_slice()).unwrap(), root);
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE did = ?")
            .bind(&bob.repo.did)
            .fetch_one(h.db.reader())
            .await
            .unwrap();
        assert_eq!(count.0, 5);
    }

    #[test]
    fn test_rkey_validation() {
        assert!(validate_rkey("3jzfcijpj2z2a").is_ok());
        assert!(validate_rkey("self").is_ok());
        assert!(validate_rkey("a-b_c.d:e~f").is_ok());
        assert!(validate_rkey("").is_err());
        assert!(validate_rkey(".").is_err());
        assert!(validate_rkey("..").is_err());
        assert!(validate_rkey("has space").is_err());
        assert!(validate_rkey(&"x".repeat(513)).is_err());
    }
}
