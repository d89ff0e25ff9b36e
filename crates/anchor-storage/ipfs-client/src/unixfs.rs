//! Minimal reader for the UnixFS `Data` protobuf message that IPFS wraps
//! file content in when it is fetched through `object/get`.

use thiserror::Error;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LENGTH_DELIMITED: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Field number of the file payload inside a UnixFS `Data` message.
const DATA_FIELD: u64 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnixfsError {
    #[error("truncated protobuf message")]
    Truncated,
    #[error("varint overflows 64 bits")]
    VarintOverflow,
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u64),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, UnixfsError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or(UnixfsError::Truncated)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(UnixfsError::VarintOverflow)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], UnixfsError> {
        let end = self.pos.checked_add(len).ok_or(UnixfsError::Truncated)?;
        let bytes = self.buf.get(self.pos..end).ok_or(UnixfsError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }
}

/// Extracts the file payload from a marshaled UnixFS node.
///
/// Nodes without a payload (directories, empty files) yield an empty slice.
pub fn unmarshal_data(marshaled: &[u8]) -> Result<&[u8], UnixfsError> {
    let mut reader = Reader::new(marshaled);
    let mut data: &[u8] = &[];

    while !reader.is_empty() {
        let key = reader.varint()?;
        let (field, wire_type) = (key >> 3, key & 0x7);
        match wire_type {
            WIRE_VARINT => {
                reader.varint()?;
            }
            WIRE_FIXED64 => {
                reader.take(8)?;
            }
            WIRE_LENGTH_DELIMITED => {
                let len = usize::try_from(reader.varint()?).map_err(|_| UnixfsError::Truncated)?;
                let bytes = reader.take(len)?;
                if field == DATA_FIELD {
                    data = bytes;
                }
            }
            WIRE_FIXED32 => {
                reader.take(4)?;
            }
            other => return Err(UnixfsError::UnsupportedWireType(other)),
        }
    }

    Ok(data)
}

/// Removes control characters left over from the UnixFS padding, keeping
/// line feeds.
pub fn strip_control_characters(content: &str) -> String {
    content
        .chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect()
}

/// Marshals `data` as a UnixFS file node, the way `ipfs add` stores small
/// files.
#[cfg(test)]
pub(crate) fn marshal_file(data: &[u8]) -> Vec<u8> {
    fn push_varint(out: &mut Vec<u8>, mut value: u64) {
        while value >= 0x80 {
            out.push((value as u8) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
    }

    let mut out = Vec::with_capacity(data.len() + 8);
    // Type = File
    push_varint(&mut out, (1 << 3) | WIRE_VARINT);
    push_varint(&mut out, 2);
    push_varint(&mut out, (DATA_FIELD << 3) | WIRE_LENGTH_DELIMITED);
    push_varint(&mut out, data.len() as u64);
    out.extend_from_slice(data);
    push_varint(&mut out, (3 << 3) | WIRE_VARINT);
    push_varint(&mut out, data.len() as u64);
    out
}
