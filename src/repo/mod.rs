/// Repository engine: a signed commit over a Merkle Search Tree of records.
///
/// A repo's head is the CID of its commit block; the commit points at the
/// MST root and carries the revision TID and a secp256k1 signature. Writes
/// are staged against the in-memory tree and become visible when `commit`
/// seals a new signed head.
pub mod blockstore;
pub mod car;
pub mod data;
pub mod mst;
pub mod tid;

use crate::crypto::K256Keypair;
use crate::error::{PdsError, PdsResult};
use blockstore::Blockstore;
use data::{cid_for, decode_dag_cbor, encode_dag_cbor, CODEC_DAG_CBOR};
use libipld::{Cid, Ipld};
use mst::Mst;
use std::collections::BTreeMap;
use tid::Tid;

pub const COMMIT_VERSION: i64 = 3;

/// A decoded repo commit
#[derive(Debug, Clone)]
pub struct Commit {
    pub did: String,
    pub version: i64,
    /// MST root
    pub data: Cid,
    pub rev: String,
    pub prev: Option<Cid>,
    pub sig: Vec<u8>,
}

impl Commit {
    pub fn decode(bytes: &[u8]) -> PdsResult<Self> {
        let Ipld::Map(map) = decode_dag_cbor(bytes)? else {
            return Err(PdsError::Repo("commit is not a map".to_string()));
        };

        let did = match map.get("did") {
            Some(Ipld::String(did)) => did.clone(),
            _ => return Err(PdsError::Repo("commit missing did".to_string())),
        };
        let version = match map.get("version") {
            Some(Ipld::Integer(v)) => *v as i64,
            _ => return Err(PdsError::Repo("commit missing version".to_string())),
        };
        let data = match map.get("data") {
            Some(Ipld::Link(cid)) => *cid,
            _ => return Err(PdsError::Repo("commit missing data".to_string())),
        };
        let rev = match map.get("rev") {
            Some(Ipld::String(rev)) => rev.clone(),
            _ => return Err(PdsError::Repo("commit missing rev".to_string())),
        };
        let prev = match map.get("prev") {
            Some(Ipld::Link(cid)) => Some(*cid),
            Some(Ipld::Null) | None => None,
            Some(_) => return Err(PdsError::Repo("invalid prev field".to_string())),
        };
        let sig = match map.get("sig") {
            Some(Ipld::Bytes(sig)) => sig.clone(),
            _ => return Err(PdsError::Repo("commit missing sig".to_string())),
        };

        if version != COMMIT_VERSION {
            return Err(PdsError::Repo(format!(
                "unsupported commit version {}",
                version
            )));
        }

        Ok(Self {
            did,
            version,
            data,
            rev,
            prev,
            sig,
        })
    }

    fn unsigned_ipld(&self) -> Ipld {
        let mut map = BTreeMap::new();
        map.insert("did".to_string(), Ipld::String(self.did.clone()));
        map.insert("version".to_string(), Ipld::Integer(self.version as i128));
        map.insert("data".to_string(), Ipld::Link(self.data));
        map.insert("rev".to_string(), Ipld::String(self.rev.clone()));
        map.insert(
            "prev".to_string(),
            self.prev.map(Ipld::Link).unwrap_or(Ipld::Null),
        );
        Ipld::Map(map)
    }

    pub fn unsigned_bytes(&self) -> PdsResult<Vec<u8>> {
        encode_dag_cbor(&self.unsigned_ipld())
    }

    pub fn signed_bytes(&self) -> PdsResult<Vec<u8>> {
        let Ipld::Map(mut map) = self.unsigned_ipld() else {
            unreachable!()
        };
        map.insert("sig".to_string(), Ipld::Bytes(self.sig.clone()));
        encode_dag_cbor(&Ipld::Map(map))
    }

    /// Check the signature against the repo's public key
    pub fn verify(&self, key: &K256Keypair) -> PdsResult<bool> {
        Ok(key.verify(&self.unsigned_bytes()?, &self.sig))
    }
}

/// An opened repository, staged mutations included
pub struct Repository<'a> {
    bs: &'a dyn Blockstore,
    did: String,
    mst: Mst,
    head: Option<Cid>,
    rev: Option<String>,
}

impl<'a> Repository<'a> {
    /// A brand new, empty repo
    pub fn create(bs: &'a dyn Blockstore, did: impl Into<String>) -> Self {
        Self {
            bs,
            did: did.into(),
            mst: Mst::new(),
            head: None,
            rev: None,
        }
    }

    /// Open an existing repo at the given commit
    pub async fn open(bs: &'a dyn Blockstore, head: Cid) -> PdsResult<Repository<'a>> {
        let commit_bytes = bs
            .get(&head)
            .await?
            .ok_or_else(|| PdsError::Repo(format!("missing commit block {}", head)))?;
        let commit = Commit::decode(&commit_bytes)?;
        let mst = Mst::load(bs, &commit.data).await?;

        Ok(Self {
            bs,
            did: commit.did,
            mst,
            head: Some(head),
            rev: Some(commit.rev),
        })
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn head(&self) -> Option<Cid> {
        self.head
    }

    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    pub fn record_count(&self) -> usize {
        self.mst.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.mst.contains(path)
    }

    /// Stage a record write. The record is encoded as dag-cbor and its block
    /// stored immediately; tree nodes follow at commit time.
    pub async fn put_record(&mut self, path: &str, record: &Ipld) -> PdsResult<Cid> {
        let bytes = encode_dag_cbor(record)?;
        let cid = cid_for(CODEC_DAG_CBOR, &bytes);
        self.bs.put(cid, bytes).await?;
        self.mst.insert(path, cid);
        Ok(cid)
    }

    /// Stage an update; the path must already hold a record.
    pub async fn update_record(&mut self, path: &str, record: &Ipld) -> PdsResult<Cid> {
        if !self.mst.contains(path) {
            return Err(PdsError::RecordNotFound(path.to_string()));
        }
        self.put_record(path, record).await
    }

    pub fn delete_record(&mut self, path: &str) -> PdsResult<()> {
        self.mst.delete(path)
    }

    pub async fn get_record(&self, path: &str) -> PdsResult<Option<(Cid, Ipld)>> {
        match self.get_record_bytes(path).await? {
            Some((cid, bytes)) => Ok(Some((cid, decode_dag_cbor(&bytes)?))),
            None => Ok(None),
        }
    }

    pub async fn get_record_bytes(&self, path: &str) -> PdsResult<Option<(Cid, Vec<u8>)>> {
        let Some(cid) = self.mst.get(path).copied() else {
            return Ok(None);
        };
        let bytes = self
            .bs
            .get(&cid)
            .await?
            .ok_or_else(|| PdsError::Repo(format!("missing record block {}", cid)))?;
        Ok(Some((cid, bytes)))
    }

    /// In-order traversal of `path -> cid`, optionally under a prefix
    pub fn for_each(&self, prefix: &str, mut f: impl FnMut(&str, &Cid)) {
        for (path, cid) in self.mst.iter_prefix(prefix) {
            f(path, cid);
        }
    }

    /// Ops needed to get from the tree at `old_root` to the staged tree
    pub async fn diff_since(&self, old_root: Option<Cid>) -> PdsResult<Vec<mst::DiffOp>> {
        let old = match old_root {
            Some(root) => {
                let old_commit_bytes = self.bs.get(&root).await?;
                match old_commit_bytes {
                    // accept either a commit cid or a bare tree root
                    Some(bytes) => match Commit::decode(&bytes) {
                        Ok(commit) => Mst::load(self.bs, &commit.data).await?,
                        Err(_) => Mst::load(self.bs, &root).await?,
                    },
                    None => return Err(PdsError::Repo(format!("missing block {}", root))),
                }
            }
            None => Mst::new(),
        };
        Ok(self.mst.diff(&old))
    }

    /// Seal the staged tree into a new signed commit.
    pub async fn commit<F>(&mut self, rev: Tid, sign: F) -> PdsResult<(Cid, Tid)>
    where
        F: FnOnce(&[u8]) -> PdsResult<Vec<u8>>,
    {
        let data = self.mst.save(self.bs).await?;

        let mut commit = Commit {
            did: self.did.clone(),
            version: COMMIT_VERSION,
            data,
            rev: rev.to_string(),
            prev: None,
            sig: Vec::new(),
        };
        commit.sig = sign(&commit.unsigned_bytes()?)?;

        let bytes = commit.signed_bytes()?;
        let cid = cid_for(CODEC_DAG_CBOR, &bytes);
        self.bs.put(cid, bytes).await?;

        self.head = Some(cid);
        self.rev = Some(commit.rev.clone());
        Ok((cid, rev))
    }
}

/// Resolve a record through the commit at `head`, touching only the commit
/// block and the tree spine. Run against a recording blockstore, the read
/// log is exactly the inclusion proof.
pub async fn prove_record(
    bs: &dyn Blockstore,
    head: &Cid,
    path: &str,
) -> PdsResult<Option<Cid>> {
    let commit_bytes = bs
        .get(head)
        .await?
        .ok_or_else(|| PdsError::Repo(format!("missing commit block {}", head)))?;
    let commit = Commit::decode(&commit_bytes)?;
    mst::walk_path(bs, &commit.data, path).await
}

/// Every block of the repo at `head`: the commit, all tree nodes, and all
/// record bodies. Returned in a stable order with the commit first.
pub async fn export_blocks(
    bs: &dyn Blockstore,
    head: &Cid,
) -> PdsResult<Vec<(Cid, Vec<u8>)>> {
    let commit_bytes = bs
        .get(head)
        .await?
        .ok_or_else(|| PdsError::Repo(format!("missing commit block {}", head)))?;
    let commit = Commit::decode(&commit_bytes)?;

    let mut out = vec![(*head, commit_bytes)];
    out.extend(mst::collect_node_blocks(bs, &commit.data).await?);

    let tree = Mst::load(bs, &commit.data).await?;
    let mut seen: std::collections::HashSet<Cid> =
        out.iter().map(|(cid, _)| *cid).collect();
    for (path, cid) in tree.iter() {
        if !seen.insert(*cid) {
            continue;
        }
        let bytes = bs
            .get(cid)
            .await?
            .ok_or_else(|| PdsError::Repo(format!("missing record block for {}", path)))?;
        out.push((*cid, bytes));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::blockstore::{MemoryBlockstore, RecordingBlockstore};
    use crate::repo::tid::TidClock;

    fn sign_with(key: &K256Keypair) -> impl FnOnce(&[u8]) -> PdsResult<Vec<u8>> + '_ {
        move |bytes| Ok(key.hash_and_sign(bytes))
    }

    fn post(text: &str) -> Ipld {
        data::normalize_record(
            "app.bsky.feed.post",
            &serde_json::json!({ "text": text }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_reopen() {
        let bs = MemoryBlockstore::new();
        let key = K256Keypair::generate();
        let clock = TidClock::new(0);

        let mut repo = Repository::create(&bs, "did:plc:alice");
        repo.put_record("app.bsky.feed.post/3jqfcqzm3fo2j", &post("hello"))
            .await
            .unwrap();
        let (head, rev) = repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let reopened = Repository::open(&bs, head).await.unwrap();
        assert_eq!(reopened.did(), "did:plc:alice");
        assert_eq!(reopened.rev(), Some(rev.as_str()));
        assert_eq!(reopened.record_count(), 1);

        let (cid, record) = reopened
            .get_record("app.bsky.feed.post/3jqfcqzm3fo2j")
            .await
            .unwrap()
            .unwrap();
        let Ipld::Map(map) = record else { panic!() };
        assert!(matches!(map.get("text"), Some(Ipld::String(t)) if t == "hello"));
        assert!(!cid.to_string().is_empty());
    }

    #[tokio::test]
    async fn test_commit_signature_verifies() {
        let bs = MemoryBlockstore::new();
        let key = K256Keypair::generate();
        let clock = TidClock::new(0);

        let mut repo = Repository::create(&bs, "did:plc:alice");
        repo.put_record("c/one", &post("one")).await.unwrap();
        let (head, _) = repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let commit = Commit::decode(&bs.get(&head).await.unwrap().unwrap()).unwrap();
        assert!(commit.verify(&key).unwrap());

        let other = K256Keypair::generate();
        assert!(!commit.verify(&other).unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let bs = MemoryBlockstore::new();
        let mut repo = Repository::create(&bs, "did:plc:alice");
        assert!(repo.update_record("c/nope", &post("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_diff_since_between_commits() {
        let bs = MemoryBlockstore::new();
        let key = K256Keypair::generate();
        let clock = TidClock::new(0);

        let mut repo = Repository::create(&bs, "did:plc:alice");
        repo.put_record("c/first", &post("first")).await.unwrap();
        let (head1, _) = repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let mut repo = Repository::open(&bs, head1).await.unwrap();
        repo.put_record("c/second", &post("second")).await.unwrap();
        repo.delete_record("c/first").unwrap();
        repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let ops = repo.diff_since(Some(head1)).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops
            .iter()
            .any(|op| op.kind == mst::DiffKind::Add && op.path == "c/second"));
        assert!(ops
            .iter()
            .any(|op| op.kind == mst::DiffKind::Del && op.path == "c/first"));

        // diff against the current head is empty
        let head2 = repo.head().unwrap();
        assert!(repo.diff_since(Some(head2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_proof_reads_are_a_sparse_subset() {
        let bs = MemoryBlockstore::new();
        let key = K256Keypair::generate();
        let clock = TidClock::new(0);

        let mut repo = Repository::create(&bs, "did:plc:alice");
        for i in 0..100 {
            repo.put_record(&format!("c/rec{:03}", i), &post(&i.to_string()))
                .await
                .unwrap();
        }
        let (head, _) = repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let recording = RecordingBlockstore::new(&bs);
        let found = prove_record(&recording, &head, "c/rec042").await.unwrap();
        assert!(found.is_some());

        let proof = recording.read_log();
        assert!(!proof.is_empty());
        // the proof is the commit plus the spine, nowhere near the whole repo
        assert!(proof.len() < 20, "proof unexpectedly large: {}", proof.len());
        assert_eq!(proof[0].0, head);
    }

    #[tokio::test]
    async fn test_export_blocks_reimports_to_same_root() {
        let bs = MemoryBlockstore::new();
        let key = K256Keypair::generate();
        let clock = TidClock::new(0);

        let mut repo = Repository::create(&bs, "did:plc:alice");
        for i in 0..25 {
            repo.put_record(&format!("c/rec{:02}", i), &post(&i.to_string()))
                .await
                .unwrap();
        }
        let (head, _) = repo.commit(clock.next(), sign_with(&key)).await.unwrap();

        let blocks = export_blocks(&bs, &head).await.unwrap();

        // replay into a fresh store; the same head must open cleanly
        let fresh = MemoryBlockstore::new();
        fresh.put_many(blocks).await.unwrap();
        let reopened = Repository::open(&fresh, head).await.unwrap();
        assert_eq!(reopened.record_count(), 25);
        assert_eq!(reopened.head(), Some(head));
    }
}
