/// Firehose frame types.
///
/// Each wire frame is two concatenated CBOR values: a header naming the
/// message type, then the payload. Error frames use `op = -1` and carry
/// `{error, message}`.
use crate::error::{PdsError, PdsResult};
use serde::{Deserialize, Serialize};

pub const OP_MESSAGE: i64 = 1;
pub const OP_ERROR: i64 = -1;

/// Frame header: `{"op": 1, "t": "#commit"}` or `{"op": -1}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub op: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// One operation inside a commit event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOp {
    /// "create", "update" or "delete"
    pub action: String,
    /// collection/rkey
    pub path: String,
    /// CID of the new record block; absent on delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// CID of the replaced block, set on delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// `#commit` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvt {
    pub seq: i64,
    pub rebase: bool,
    pub too_big: bool,
    /// DID of the repo
    pub repo: String,
    /// CID of the new commit
    pub commit: String,
    pub rev: String,
    /// Revision before this commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// CAR of the incremental block diff
    pub blocks: Vec<u8>,
    pub ops: Vec<CommitOp>,
    pub blobs: Vec<String>,
    pub time: String,
}

/// `#identity` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEvt {
    pub seq: i64,
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub time: String,
}

/// `#account` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvt {
    pub seq: i64,
    pub did: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub time: String,
}

/// `#info` payload (control messages, e.g. OutdatedCursor)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoFrame {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A sequenced event, payload plus message type
#[derive(Debug, Clone)]
pub enum SeqEvent {
    Commit(CommitEvt),
    Identity(IdentityEvt),
    Account(AccountEvt),
}

impl SeqEvent {
    pub fn message_type(&self) -> &'static str {
        match self {
            SeqEvent::Commit(_) => "#commit",
            SeqEvent::Identity(_) => "#identity",
            SeqEvent::Account(_) => "#account",
        }
    }

    pub fn seq(&self) -> i64 {
        match self {
            SeqEvent::Commit(evt) => evt.seq,
            SeqEvent::Identity(evt) => evt.seq,
            SeqEvent::Account(evt) => evt.seq,
        }
    }

    /// Stamp seq and time into the payload. Runs before serialization so the
    /// stored frame always carries its own sequence number.
    pub fn stamp(&mut self, seq: i64, time: String) {
        match self {
            SeqEvent::Commit(evt) => {
                evt.seq = seq;
                evt.time = time;
            }
            SeqEvent::Identity(evt) => {
                evt.seq = seq;
                evt.time = time;
            }
            SeqEvent::Account(evt) => {
                evt.seq = seq;
                evt.time = time;
            }
        }
    }

    /// Encode as a wire frame: `CBOR(header) ‖ CBOR(payload)`
    pub fn encode_frame(&self) -> PdsResult<Vec<u8>> {
        let header = FrameHeader {
            op: OP_MESSAGE,
            t: Some(self.message_type().to_string()),
        };
        let mut out = serde_cbor::to_vec(&header)
            .map_err(|e| PdsError::Internal(format!("frame header encoding failed: {}", e)))?;
        let payload = match self {
            SeqEvent::Commit(evt) => serde_cbor::to_vec(evt),
            SeqEvent::Identity(evt) => serde_cbor::to_vec(evt),
            SeqEvent::Account(evt) => serde_cbor::to_vec(evt),
        }
        .map_err(|e| PdsError::Internal(format!("frame payload encoding failed: {}", e)))?;
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

/// Encode an `#info` control frame
pub fn encode_info_frame(info: &InfoFrame) -> PdsResult<Vec<u8>> {
    let header = FrameHeader {
        op: OP_MESSAGE,
        t: Some("#info".to_string()),
    };
    let mut out = serde_cbor::to_vec(&header)
        .map_err(|e| PdsError::Internal(format!("frame header encoding failed: {}", e)))?;
    out.extend_from_slice(
        &serde_cbor::to_vec(info)
            .map_err(|e| PdsError::Internal(format!("frame payload encoding failed: {}", e)))?,
    );
    Ok(out)
}

/// Encode a terminal error frame
pub fn encode_error_frame(error: &ErrorFrame) -> PdsResult<Vec<u8>> {
    let header = FrameHeader {
        op: OP_ERROR,
        t: None,
    };
    let mut out = serde_cbor::to_vec(&header)
        .map_err(|e| PdsError::Internal(format!("frame header encoding failed: {}", e)))?;
    out.extend_from_slice(
        &serde_cbor::to_vec(error)
            .map_err(|e| PdsError::Internal(format!("frame payload encoding failed: {}", e)))?,
    );
    Ok(out)
}

/// Split a wire frame back into header and payload bytes
pub fn decode_frame(bytes: &[u8]) -> PdsResult<(FrameHeader, &[u8])> {
    let mut de = serde_cbor::Deserializer::from_slice(bytes);
    let header = FrameHeader::deserialize(&mut de)
        .map_err(|e| PdsError::Internal(format!("frame header decoding failed: {}", e)))?;
    let offset = de.byte_offset();
    Ok((header, &bytes[offset..]))
}

/// Decode a full message frame back into a SeqEvent
pub fn decode_event_frame(bytes: &[u8]) -> PdsResult<SeqEvent> {
    let (header, payload) = decode_frame(bytes)?;
    let t = header.t.as_deref().unwrap_or("");
    let decode_err =
        |e: serde_cbor::Error| PdsError::Internal(format!("frame payload decoding failed: {}", e));
    match t {
        "#commit" => Ok(SeqEvent::Commit(
            serde_cbor::from_slice(payload).map_err(decode_err)?,
        )),
        "#identity" => Ok(SeqEvent::Identity(
            serde_cbor::from_slice(payload).map_err(decode_err)?,
        )),
        "#account" => Ok(SeqEvent::Account(
            serde_cbor::from_slice(payload).map_err(decode_err)?,
        )),
        other => Err(PdsError::Internal(format!("unknown frame type {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_evt() -> CommitEvt {
        CommitEvt {
            seq: 0,
            rebase: false,
            too_big: false,
            repo: "did:plc:tester".to_string(),
            commit: "bafyreihdpi3a".to_string(),
            rev: "3jzfcijpj2z2a".to_string(),
            since: None,
            blocks: vec![1, 2, 3],
            ops: vec![CommitOp {
                action: "create".to_string(),
                path: "app.bsky.feed.post/3jzfcijpj2z2a".to_string(),
                cid: Some("bafyreihdpi3a".to_string()),
                prev: None,
            }],
            blobs: vec![],
            time: String::new(),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let mut evt = SeqEvent::Commit(commit_evt());
        evt.stamp(42, "2024-06-01T00:00:00Z".to_string());
        let frame = evt.encode_frame().unwrap();

        let decoded = decode_event_frame(&frame).unwrap();
        assert_eq!(decoded.seq(), 42);
        let SeqEvent::Commit(commit) = decoded else {
            panic!("wrong frame type")
        };
        assert_eq!(commit.repo, "did:plc:tester");
        assert_eq!(commit.ops.len(), 1);
        assert_eq!(commit.time, "2024-06-01T00:00:00Z");
    }

    #[test]
    fn test_header_identifies_message_type() {
        let evt = SeqEvent::Identity(IdentityEvt {
            seq: 7,
            did: "did:plc:tester".to_string(),
            handle: Some("tester.example.com".to_string()),
            time: "2024-06-01T00:00:00Z".to_string(),
        });
        let frame = evt.encode_frame().unwrap();
        let (header, _) = decode_frame(&frame).unwrap();
        assert_eq!(header.op, OP_MESSAGE);
        assert_eq!(header.t.as_deref(), Some("#identity"));
    }

    #[test]
    fn test_error_frame_has_negative_op() {
        let frame = encode_error_frame(&ErrorFrame {
            error: "ConsumerTooSlow".to_string(),
            message: None,
        })
        .unwrap();
        let (header, payload) = decode_frame(&frame).unwrap();
        assert_eq!(header.op, OP_ERROR);
        assert_eq!(header.t, None);

        let err: ErrorFrame = serde_cbor::from_slice(payload).unwrap();
        assert_eq!(err.error, "ConsumerTooSlow");
    }
}
