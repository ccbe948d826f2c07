/// Merkle Search Tree over a blockstore.
///
/// Keys are `collection/rkey` paths; values are record CIDs. A key's layer is
/// the number of leading zero 2-bit nibbles of SHA-256(key), so the node
/// structure is a pure function of the key set: two trees holding the same
/// entries always share a root CID. Mutations therefore work on the flat
/// entry map and re-derive the canonical node blocks on save; `put` into a
/// content-addressed store is idempotent, so rewriting unchanged nodes is a
/// no-op at the storage layer.
///
/// Node block layout (dag-cbor):
///   { "l": link|null, "e": [ { "p": int, "k": bytes, "v": link, "t": link|null } ] }
/// with `p`/`k` prefix-compressing each key against the previous entry.
use crate::error::{PdsError, PdsResult};
use crate::repo::blockstore::Blockstore;
use crate::repo::data::{cid_for, decode_dag_cbor, encode_dag_cbor, CODEC_DAG_CBOR};
use libipld::{Cid, Ipld};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Layer of a key: leading zero 2-bit nibbles of its SHA-256
pub fn key_layer(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut layer = 0;
    for byte in digest {
        for shift in [6u8, 4, 2, 0] {
            if (byte >> shift) & 0x03 != 0 {
                return layer;
            }
            layer += 1;
        }
    }
    layer
}

/// One entry of a decoded node, with the key decompressed
#[derive(Debug, Clone)]
struct NodeEntry {
    key: String,
    value: Cid,
    tree: Option<Cid>,
}

/// A decoded MST node
#[derive(Debug, Clone)]
struct Node {
    left: Option<Cid>,
    entries: Vec<NodeEntry>,
}

/// Kind of change between two tree states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Add,
    Mut,
    Del,
}

/// One entry of a tree diff
#[derive(Debug, Clone)]
pub struct DiffOp {
    pub kind: DiffKind,
    pub path: String,
    pub new_cid: Option<Cid>,
    pub old_cid: Option<Cid>,
}

/// The tree, materialized as its entry map
#[derive(Debug, Clone, Default)]
pub struct Mst {
    leaves: BTreeMap<String, Cid>,
}

impl Mst {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every leaf reachable from `root`.
    pub async fn load(bs: &dyn Blockstore, root: &Cid) -> PdsResult<Self> {
        let mut leaves = BTreeMap::new();
        let mut stack = vec![*root];

        while let Some(cid) = stack.pop() {
            let node = read_node(bs, &cid).await?;
            if let Some(left) = node.left {
                stack.push(left);
            }
            for entry in node.entries {
                if let Some(tree) = entry.tree {
                    stack.push(tree);
                }
                if leaves.insert(entry.key.clone(), entry.value).is_some() {
                    return Err(PdsError::Repo(format!(
                        "duplicate key {} in tree {}",
                        entry.key, root
                    )));
                }
            }
        }

        Ok(Self { leaves })
    }

    pub fn get(&self, key: &str) -> Option<&Cid> {
        self.leaves.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.leaves.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: Cid) {
        self.leaves.insert(key.to_string(), value);
    }

    pub fn delete(&mut self, key: &str) -> PdsResult<()> {
        if self.leaves.remove(key).is_none() {
            return Err(PdsError::RecordNotFound(key.to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// In-order iteration, optionally restricted to a key prefix
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Cid)> + 'a {
        self.leaves
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Cid)> {
        self.leaves.iter()
    }

    /// Derive the canonical node blocks for the current entry set. Returns
    /// the root CID and every node block, root first.
    pub fn to_blocks(&self) -> PdsResult<(Cid, Vec<(Cid, Vec<u8>)>)> {
        let items: Vec<(&String, &Cid)> = self.leaves.iter().collect();
        let top_layer = items.iter().map(|(k, _)| key_layer(k)).max().unwrap_or(0);

        let mut blocks = Vec::new();
        let root = build_node(top_layer, &items, &mut blocks)?;
        blocks.reverse(); // children were emitted first
        Ok((root, blocks))
    }

    /// Write the canonical node blocks and return the root CID.
    pub async fn save(&self, bs: &dyn Blockstore) -> PdsResult<Cid> {
        let (root, blocks) = self.to_blocks()?;
        bs.put_many(blocks).await?;
        Ok(root)
    }

    /// Compare against an older tree state.
    pub fn diff(&self, old: &Mst) -> Vec<DiffOp> {
        let mut ops = Vec::new();

        for (key, new_cid) in &self.leaves {
            match old.leaves.get(key) {
                None => ops.push(DiffOp {
                    kind: DiffKind::Add,
                    path: key.clone(),
                    new_cid: Some(*new_cid),
                    old_cid: None,
                }),
                Some(old_cid) if old_cid != new_cid => ops.push(DiffOp {
                    kind: DiffKind::Mut,
                    path: key.clone(),
                    new_cid: Some(*new_cid),
                    old_cid: Some(*old_cid),
                }),
                Some(_) => {}
            }
        }

        for (key, old_cid) in &old.leaves {
            if !self.leaves.contains_key(key) {
                ops.push(DiffOp {
                    kind: DiffKind::Del,
                    path: key.clone(),
                    new_cid: None,
                    old_cid: Some(*old_cid),
                });
            }
        }

        ops.sort_by(|a, b| a.path.cmp(&b.path));
        ops
    }
}

/// Resolve one key by descending from `root`, touching only the path nodes.
/// This is what inclusion proofs record.
pub async fn walk_path(
    bs: &dyn Blockstore,
    root: &Cid,
    key: &str,
) -> PdsResult<Option<Cid>> {
    let mut cursor = *root;

    loop {
        let node = read_node(bs, &cursor).await?;

        let mut descend = node.left;
        for entry in &node.entries {
            match entry.key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(entry.value)),
                std::cmp::Ordering::Less => descend = entry.tree,
                std::cmp::Ordering::Greater => break,
            }
        }

        match descend {
            Some(next) => cursor = next,
            None => return Ok(None),
        }
    }
}

/// Collect every node CID reachable from `root`, in traversal order.
pub async fn collect_node_blocks(
    bs: &dyn Blockstore,
    root: &Cid,
) -> PdsResult<Vec<(Cid, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut stack = vec![*root];

    while let Some(cid) = stack.pop() {
        let bytes = bs
            .get(&cid)
            .await?
            .ok_or_else(|| PdsError::Repo(format!("missing tree node {}", cid)))?;
        let node = decode_node(&bytes)?;
        out.push((cid, bytes));

        if let Some(left) = node.left {
            stack.push(left);
        }
        for entry in node.entries {
            if let Some(tree) = entry.tree {
                stack.push(tree);
            }
        }
    }

    Ok(out)
}

async fn read_node(bs: &dyn Blockstore, cid: &Cid) -> PdsResult<Node> {
    let bytes = bs
        .get(cid)
        .await?
        .ok_or_else(|| PdsError::Repo(format!("missing tree node {}", cid)))?;
    decode_node(&bytes)
}

/// Recursively emit node blocks for `items`, all of which sit at or below
/// `layer`. Children are pushed before their parent; the caller reverses.
fn build_node(
    layer: u32,
    items: &[(&String, &Cid)],
    blocks: &mut Vec<(Cid, Vec<u8>)>,
) -> PdsResult<Cid> {
    let mut left: Option<Cid> = None;
    let mut entries: Vec<NodeEntry> = Vec::new();
    let mut pending: Vec<(&String, &Cid)> = Vec::new();

    for (key, value) in items {
        if key_layer(key) == layer {
            let sub = flush_subtree(layer, &mut pending, blocks)?;
            match entries.last_mut() {
                None => left = sub,
                Some(prev) => prev.tree = sub,
            }
            entries.push(NodeEntry {
                key: (*key).clone(),
                value: **value,
                tree: None,
            });
        } else {
            pending.push((key, value));
        }
    }

    let trailing = flush_subtree(layer, &mut pending, blocks)?;
    match entries.last_mut() {
        None => left = trailing,
        Some(prev) => prev.tree = trailing,
    }

    let bytes = encode_node(&Node { left, entries })?;
    let cid = cid_for(CODEC_DAG_CBOR, &bytes);
    blocks.push((cid, bytes));
    Ok(cid)
}

/// Build the accumulated lower-layer keys into a child node, if any
fn flush_subtree(
    layer: u32,
    pending: &mut Vec<(&String, &Cid)>,
    blocks: &mut Vec<(Cid, Vec<u8>)>,
) -> PdsResult<Option<Cid>> {
    if pending.is_empty() {
        return Ok(None);
    }
    let sub = build_node(layer - 1, pending, blocks)?;
    pending.clear();
    Ok(Some(sub))
}

fn encode_node(node: &Node) -> PdsResult<Vec<u8>> {
    let mut entry_list = Vec::with_capacity(node.entries.len());
    let mut prev_key: &str = "";

    for entry in &node.entries {
        let shared = common_prefix_len(prev_key.as_bytes(), entry.key.as_bytes());
        let mut map = BTreeMap::new();
        map.insert("p".to_string(), Ipld::Integer(shared as i128));
        map.insert(
            "k".to_string(),
            Ipld::Bytes(entry.key.as_bytes()[shared..].to_vec()),
        );
        map.insert("v".to_string(), Ipld::Link(entry.value));
        map.insert(
            "t".to_string(),
            entry.tree.map(Ipld::Link).unwrap_or(Ipld::Null),
        );
        entry_list.push(Ipld::Map(map));
        prev_key = &entry.key;
    }

    let mut map = BTreeMap::new();
    map.insert(
        "l".to_string(),
        node.left.map(Ipld::Link).unwrap_or(Ipld::Null),
    );
    map.insert("e".to_string(), Ipld::List(entry_list));
    encode_dag_cbor(&Ipld::Map(map))
}

fn decode_node(bytes: &[u8]) -> PdsResult<Node> {
    let Ipld::Map(map) = decode_dag_cbor(bytes)? else {
        return Err(PdsError::Repo("tree node is not a map".to_string()));
    };

    let left = match map.get("l") {
        Some(Ipld::Link(cid)) => Some(*cid),
        Some(Ipld::Null) | None => None,
        Some(_) => return Err(PdsError::Repo("invalid l field".to_string())),
    };

    let Some(Ipld::List(raw_entries)) = map.get("e") else {
        return Err(PdsError::Repo("missing e field".to_string()));
    };

    let mut entries = Vec::with_capacity(raw_entries.len());
    let mut prev_key: Vec<u8> = Vec::new();

    for raw in raw_entries {
        let Ipld::Map(entry) = raw else {
            return Err(PdsError::Repo("tree entry is not a map".to_string()));
        };

        let prefix = match entry.get("p") {
            Some(Ipld::Integer(p)) if *p >= 0 => *p as usize,
            _ => return Err(PdsError::Repo("invalid p field".to_string())),
        };
        let Some(Ipld::Bytes(suffix)) = entry.get("k") else {
            return Err(PdsError::Repo("invalid k field".to_string()));
        };
        let Some(Ipld::Link(value)) = entry.get("v") else {
            return Err(PdsError::Repo("invalid v field".to_string()));
        };
        let tree = match entry.get("t") {
            Some(Ipld::Link(cid)) => Some(*cid),
            Some(Ipld::Null) | None => None,
            Some(_) => return Err(PdsError::Repo("invalid t field".to_string())),
        };

        if prefix > prev_key.len() {
            return Err(PdsError::Repo("key prefix overruns".to_string()));
        }
        let mut key = prev_key[..prefix].to_vec();
        key.extend_from_slice(suffix);
        prev_key = key.clone();

        entries.push(NodeEntry {
            key: String::from_utf8(key)
                .map_err(|_| PdsError::Repo("non-utf8 tree key".to_string()))?,
            value: *value,
            tree,
        });
    }

    Ok(Node { left, entries })
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::blockstore::MemoryBlockstore;
    use crate::repo::data::CODEC_RAW;

    fn record_cid(tag: &str) -> Cid {
        cid_for(CODEC_RAW, tag.as_bytes())
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let bs = MemoryBlockstore::new();

        let mut mst = Mst::new();
        for i in 0..50 {
            mst.insert(
                &format!("app.bsky.feed.post/entry{:03}", i),
                record_cid(&format!("rec{}", i)),
            );
        }

        let root = mst.save(&bs).await.unwrap();
        let loaded = Mst::load(&bs, &root).await.unwrap();
        assert_eq!(loaded.len(), 50);
        assert_eq!(
            loaded.get("app.bsky.feed.post/entry007"),
            Some(&record_cid("rec7"))
        );
    }

    #[tokio::test]
    async fn test_root_is_a_pure_function_of_the_entry_set() {
        let bs = MemoryBlockstore::new();

        let mut forward = Mst::new();
        let mut backward = Mst::new();
        let keys: Vec<String> = (0..30)
            .map(|i| format!("app.bsky.graph.follow/k{:02}", i))
            .collect();

        for key in &keys {
            forward.insert(key, record_cid(key));
        }
        for key in keys.iter().rev() {
            backward.insert(key, record_cid(key));
        }

        let root_a = forward.save(&bs).await.unwrap();
        let root_b = backward.save(&bs).await.unwrap();
        assert_eq!(root_a, root_b);

        // insert-then-delete also lands on the same root
        let mut churned = forward.clone();
        churned.insert("app.bsky.graph.follow/extra", record_cid("extra"));
        churned.delete("app.bsky.graph.follow/extra").unwrap();
        assert_eq!(churned.save(&bs).await.unwrap(), root_a);
    }

    #[tokio::test]
    async fn test_empty_tree_has_a_root() {
        let bs = MemoryBlockstore::new();
        let mst = Mst::new();
        let root = mst.save(&bs).await.unwrap();

        let loaded = Mst::load(&bs, &root).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_walk_path_touches_only_the_spine() {
        let bs = MemoryBlockstore::new();

        let mut mst = Mst::new();
        for i in 0..200 {
            mst.insert(&format!("com.example.rec/k{:04}", i), record_cid(&i.to_string()));
        }
        let root = mst.save(&bs).await.unwrap();

        let found = walk_path(&bs, &root, "com.example.rec/k0123")
            .await
            .unwrap();
        assert_eq!(found, Some(record_cid("123")));

        let missing = walk_path(&bs, &root, "com.example.rec/missing")
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_diff_reports_adds_mutations_and_deletes() {
        let mut old = Mst::new();
        old.insert("c/keep", record_cid("keep"));
        old.insert("c/change", record_cid("v1"));
        old.insert("c/drop", record_cid("drop"));

        let mut new = old.clone();
        new.insert("c/change", record_cid("v2"));
        new.delete("c/drop").unwrap();
        new.insert("c/fresh", record_cid("fresh"));

        let ops = new.diff(&old);
        assert_eq!(ops.len(), 3);

        let by_path: std::collections::HashMap<_, _> =
            ops.iter().map(|op| (op.path.as_str(), op)).collect();
        assert_eq!(by_path["c/fresh"].kind, DiffKind::Add);
        assert_eq!(by_path["c/change"].kind, DiffKind::Mut);
        assert_eq!(by_path["c/change"].old_cid, Some(record_cid("v1")));
        assert_eq!(by_path["c/drop"].kind, DiffKind::Del);
        assert_eq!(by_path["c/drop"].old_cid, Some(record_cid("drop")));
    }

    #[test]
    fn test_diff_of_identical_trees_is_empty() {
        let mut mst = Mst::new();
        mst.insert("a/b", record_cid("x"));
        assert!(mst.diff(&mst.clone()).is_empty());
    }

    #[test]
    fn test_delete_missing_key_errors() {
        let mut mst = Mst::new();
        assert!(mst.delete("a/b").is_err());
    }

    #[test]
    fn test_key_layer_distribution() {
        // layer is deterministic per key
        assert_eq!(key_layer("app.bsky.feed.post/454397e440ec"), key_layer("app.bsky.feed.post/454397e440ec"));

        // with 2-bit nibbles roughly 3/4 of keys sit at layer 0
        let at_zero = (0..1000)
            .filter(|i| key_layer(&format!("col/key{}", i)) == 0)
            .count();
        assert!(at_zero > 600, "layer-0 fraction suspiciously low: {}", at_zero);
    }

    #[tokio::test]
    async fn test_iter_prefix_is_ordered_and_bounded() {
        let mut mst = Mst::new();
        mst.insert("app.bsky.feed.like/a", record_cid("1"));
        mst.insert("app.bsky.feed.post/a", record_cid("2"));
        mst.insert("app.bsky.feed.post/b", record_cid("3"));
        mst.insert("app.bsky.graph.follow/a", record_cid("4"));

        let posts: Vec<&String> = mst.iter_prefix("app.bsky.feed.post/").map(|(k, _)| k).collect();
        assert_eq!(posts, vec!["app.bsky.feed.post/a", "app.bsky.feed.post/b"]);
    }
}
