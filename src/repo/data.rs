/// Record payload handling.
///
/// Records arrive as arbitrary JSON and are stored as dag-cbor. The bridge
/// between the two preserves integer precision, maps `{"$link": ...}` to CID
/// links and `{"$bytes": ...}` to byte strings, and defaults the `$type`
/// discriminator from the collection NSID.
use crate::error::{PdsError, PdsResult};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::multihash::{Code, MultihashDigest};
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;

/// dag-cbor multicodec
pub const CODEC_DAG_CBOR: u64 = 0x71;
/// raw multicodec, used for blob bodies
pub const CODEC_RAW: u64 = 0x55;

/// CID for a block of bytes under the given codec (SHA2-256 multihash)
pub fn cid_for(codec: u64, bytes: &[u8]) -> Cid {
    Cid::new_v1(codec, Code::Sha2_256.digest(bytes))
}

/// Encode an IPLD value as dag-cbor
pub fn encode_dag_cbor(value: &Ipld) -> PdsResult<Vec<u8>> {
    DagCborCodec
        .encode(value)
        .map_err(|e| PdsError::Repo(format!("dag-cbor encoding failed: {}", e)))
}

/// Decode dag-cbor bytes into an IPLD value
pub fn decode_dag_cbor(bytes: &[u8]) -> PdsResult<Ipld> {
    DagCborCodec
        .decode(bytes)
        .map_err(|e| PdsError::Repo(format!("dag-cbor decoding failed: {}", e)))
}

/// Convert incoming JSON to IPLD, preserving integers exactly and decoding
/// the `$link`/`$bytes` wrapper objects.
pub fn json_to_ipld(value: &serde_json::Value) -> PdsResult<Ipld> {
    match value {
        serde_json::Value::Null => Ok(Ipld::Null),
        serde_json::Value::Bool(b) => Ok(Ipld::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Ipld::Integer(i as i128))
            } else if let Some(u) = n.as_u64() {
                Ok(Ipld::Integer(u as i128))
            } else if let Some(f) = n.as_f64() {
                Ok(Ipld::Float(f))
            } else {
                Err(PdsError::InvalidRequest("unrepresentable number".into()))
            }
        }
        serde_json::Value::String(s) => Ok(Ipld::String(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_to_ipld(item)?);
            }
            Ok(Ipld::List(out))
        }
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(link)) = map.get("$link") {
                    let cid = Cid::try_from(link.as_str()).map_err(|e| {
                        PdsError::InvalidRequest(format!("invalid $link cid: {}", e))
                    })?;
                    return Ok(Ipld::Link(cid));
                }
                if let Some(serde_json::Value::String(b64)) = map.get("$bytes") {
                    let bytes = STANDARD_NO_PAD.decode(b64).map_err(|e| {
                        PdsError::InvalidRequest(format!("invalid $bytes value: {}", e))
                    })?;
                    return Ok(Ipld::Bytes(bytes));
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_ipld(v)?);
            }
            Ok(Ipld::Map(out))
        }
    }
}

/// Convert stored IPLD back to the JSON wire shape
pub fn ipld_to_json(value: &Ipld) -> serde_json::Value {
    match value {
        Ipld::Null => serde_json::Value::Null,
        Ipld::Bool(b) => serde_json::Value::Bool(*b),
        Ipld::Integer(i) => serde_json::json!(*i as i64),
        Ipld::Float(f) => serde_json::json!(f),
        Ipld::String(s) => serde_json::Value::String(s.clone()),
        Ipld::Bytes(b) => serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(b) }),
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
        Ipld::List(items) => {
            serde_json::Value::Array(items.iter().map(ipld_to_json).collect())
        }
        Ipld::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), ipld_to_json(v)))
                .collect(),
        ),
    }
}

/// Normalize a record payload: must be a map, and `$type` defaults to the
/// collection NSID when missing or empty.
pub fn normalize_record(collection: &str, value: &serde_json::Value) -> PdsResult<Ipld> {
    let ipld = json_to_ipld(value)?;
    let Ipld::Map(mut map) = ipld else {
        return Err(PdsError::InvalidRequest("record must be an object".into()));
    };

    let needs_type = match map.get("$type") {
        None => true,
        Some(Ipld::String(s)) => s.is_empty(),
        Some(_) => {
            return Err(PdsError::InvalidRequest("$type must be a string".into()));
        }
    };
    if needs_type {
        map.insert("$type".to_string(), Ipld::String(collection.to_string()));
    }

    Ok(Ipld::Map(map))
}

/// Collect every blob CID referenced by a record. A blob reference is a map
/// with `$type == "blob"` whose `ref` is a link (or a CID in string form).
/// Nested maps and arrays are descended; each distinct CID counts once.
pub fn extract_blob_cids(value: &Ipld) -> Vec<Cid> {
    let mut found = Vec::new();
    walk_blobs(value, &mut found);
    found.dedup_preserving_order()
}

fn walk_blobs(value: &Ipld, out: &mut Vec<Cid>) {
    match value {
        Ipld::Map(map) => {
            if matches!(map.get("$type"), Some(Ipld::String(t)) if t == "blob") {
                match map.get("ref") {
                    Some(Ipld::Link(cid)) => out.push(*cid),
                    Some(Ipld::String(s)) => {
                        if let Ok(cid) = Cid::try_from(s.as_str()) {
                            out.push(cid);
                        }
                    }
                    _ => {}
                }
            }
            for v in map.values() {
                walk_blobs(v, out);
            }
        }
        Ipld::List(items) => {
            for item in items {
                walk_blobs(item, out);
            }
        }
        _ => {}
    }
}

trait DedupPreservingOrder {
    fn dedup_preserving_order(self) -> Self;
}

impl DedupPreservingOrder for Vec<Cid> {
    fn dedup_preserving_order(self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.into_iter().filter(|c| seen.insert(*c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_survive_the_round_trip() {
        let json = serde_json::json!({"count": 9007199254740993i64, "neg": -42});
        let ipld = json_to_ipld(&json).unwrap();
        let bytes = encode_dag_cbor(&ipld).unwrap();
        let back = decode_dag_cbor(&bytes).unwrap();
        let json_back = ipld_to_json(&back);
        assert_eq!(json_back["count"], serde_json::json!(9007199254740993i64));
        assert_eq!(json_back["neg"], serde_json::json!(-42));
    }

    #[test]
    fn test_link_wrapper_becomes_a_real_link() {
        let cid = cid_for(CODEC_RAW, b"some blob");
        let json = serde_json::json!({"ref": {"$link": cid.to_string()}});
        let ipld = json_to_ipld(&json).unwrap();
        let Ipld::Map(map) = &ipld else { panic!() };
        assert!(matches!(map.get("ref"), Some(Ipld::Link(c)) if *c == cid));
        assert_eq!(ipld_to_json(&ipld)["ref"]["$link"], cid.to_string());
    }

    #[test]
    fn test_normalize_defaults_type_from_collection() {
        let value = serde_json::json!({"text": "hi"});
        let ipld = normalize_record("app.bsky.feed.post", &value).unwrap();
        let Ipld::Map(map) = &ipld else { panic!() };
        assert!(
            matches!(map.get("$type"), Some(Ipld::String(t)) if t == "app.bsky.feed.post")
        );

        // an explicit $type is left alone
        let value = serde_json::json!({"$type": "other.thing", "text": "hi"});
        let ipld = normalize_record("app.bsky.feed.post", &value).unwrap();
        let Ipld::Map(map) = &ipld else { panic!() };
        assert!(matches!(map.get("$type"), Some(Ipld::String(t)) if t == "other.thing"));
    }

    #[test]
    fn test_normalize_rejects_non_objects() {
        assert!(normalize_record("app.bsky.feed.post", &serde_json::json!("nope")).is_err());
        assert!(normalize_record("app.bsky.feed.post", &serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_blob_extraction_descends_and_dedupes() {
        let blob_a = cid_for(CODEC_RAW, b"a");
        let blob_b = cid_for(CODEC_RAW, b"b");
        let json = serde_json::json!({
            "embed": {
                "images": [
                    {"image": {"$type": "blob", "ref": {"$link": blob_a.to_string()}, "mimeType": "image/png", "size": 1}},
                    {"image": {"$type": "blob", "ref": {"$link": blob_b.to_string()}, "mimeType": "image/png", "size": 1}},
                ],
            },
            "banner": {"$type": "blob", "ref": {"$link": blob_a.to_string()}, "mimeType": "image/png", "size": 1},
        });
        let ipld = json_to_ipld(&json).unwrap();
        let cids = extract_blob_cids(&ipld);
        assert_eq!(cids.len(), 2);
        assert!(cids.contains(&blob_a));
        assert!(cids.contains(&blob_b));
    }

    #[test]
    fn test_blob_extraction_accepts_legacy_string_refs() {
        let blob = cid_for(CODEC_RAW, b"legacy");
        let json = serde_json::json!({
            "avatar": {"$type": "blob", "ref": blob.to_string(), "mimeType": "image/jpeg"},
        });
        let ipld = json_to_ipld(&json).unwrap();
        assert_eq!(extract_blob_cids(&ipld), vec![blob]);
    }
}
