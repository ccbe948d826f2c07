/// CARv1 encoding and decoding.
///
/// Layout: `varint(len) ‖ dag-cbor header {version: 1, roots: [link]}`, then
/// repeated `varint(len(cid) + len(data)) ‖ cid ‖ data` frames.
use crate::error::{PdsError, PdsResult};
use crate::repo::data::encode_dag_cbor;
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Incremental CAR builder
pub struct CarWriter {
    buf: Vec<u8>,
}

impl CarWriter {
    pub fn new(roots: &[Cid]) -> PdsResult<Self> {
        let mut map = BTreeMap::new();
        map.insert(
            "roots".to_string(),
            Ipld::List(roots.iter().copied().map(Ipld::Link).collect()),
        );
        map.insert("version".to_string(), Ipld::Integer(1));
        let header = encode_dag_cbor(&Ipld::Map(map))?;

        let mut buf = Vec::new();
        write_varint(&mut buf, header.len() as u64);
        buf.extend_from_slice(&header);
        Ok(Self { buf })
    }

    pub fn write_block(&mut self, cid: &Cid, data: &[u8]) {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.buf, (cid_bytes.len() + data.len()) as u64);
        self.buf.extend_from_slice(&cid_bytes);
        self.buf.extend_from_slice(data);
    }

    pub fn write_blocks<'a>(&mut self, blocks: impl IntoIterator<Item = &'a (Cid, Vec<u8>)>) {
        for (cid, data) in blocks {
            self.write_block(cid, data);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A fully parsed CAR file
#[derive(Debug)]
pub struct CarContents {
    pub roots: Vec<Cid>,
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

/// Parse a CAR file from memory.
pub fn decode_car(bytes: &[u8]) -> PdsResult<CarContents> {
    let mut offset = 0usize;

    let header_len = read_varint(bytes, &mut offset)? as usize;
    let header_end = offset
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| PdsError::InvalidRequest("truncated car header".to_string()))?;
    let header = crate::repo::data::decode_dag_cbor(&bytes[offset..header_end])?;
    offset = header_end;

    let Ipld::Map(header_map) = header else {
        return Err(PdsError::InvalidRequest("car header is not a map".to_string()));
    };
    match header_map.get("version") {
        Some(Ipld::Integer(1)) => {}
        _ => return Err(PdsError::InvalidRequest("unsupported car version".to_string())),
    }
    let roots = match header_map.get("roots") {
        Some(Ipld::List(items)) => items
            .iter()
            .map(|item| match item {
                Ipld::Link(cid) => Ok(*cid),
                _ => Err(PdsError::InvalidRequest("car root is not a link".to_string())),
            })
            .collect::<PdsResult<Vec<Cid>>>()?,
        _ => return Err(PdsError::InvalidRequest("car header missing roots".to_string())),
    };

    let mut blocks = Vec::new();
    while offset < bytes.len() {
        let frame_len = read_varint(bytes, &mut offset)? as usize;
        let frame_end = offset
            .checked_add(frame_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| PdsError::InvalidRequest("truncated car block".to_string()))?;

        let mut cursor = Cursor::new(&bytes[offset..frame_end]);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| PdsError::InvalidRequest(format!("invalid cid in car: {}", e)))?;
        let data_start = offset + cursor.position() as usize;
        blocks.push((cid, bytes[data_start..frame_end].to_vec()));
        offset = frame_end;
    }

    Ok(CarContents { roots, blocks })
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn read_varint(bytes: &[u8], offset: &mut usize) -> PdsResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| PdsError::InvalidRequest("truncated varint".to_string()))?;
        *offset += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(PdsError::InvalidRequest("varint too large".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::data::{cid_for, CODEC_DAG_CBOR, CODEC_RAW};

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_varint(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn test_car_round_trip() {
        let root = cid_for(CODEC_DAG_CBOR, b"commit");
        let rec = cid_for(CODEC_RAW, b"record body");

        let mut writer = CarWriter::new(&[root]).unwrap();
        writer.write_block(&root, b"commit");
        writer.write_block(&rec, b"record body");
        let bytes = writer.into_bytes();

        let parsed = decode_car(&bytes).unwrap();
        assert_eq!(parsed.roots, vec![root]);
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[0], (root, b"commit".to_vec()));
        assert_eq!(parsed.blocks[1], (rec, b"record body".to_vec()));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let root = cid_for(CODEC_DAG_CBOR, b"commit");
        let mut writer = CarWriter::new(&[root]).unwrap();
        writer.write_block(&root, b"commit");
        let bytes = writer.into_bytes();

        assert!(decode_car(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode_car(&[0xff, 0xff]).is_err());
    }
}
