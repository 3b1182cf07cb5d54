//! OBEX header encoding.
//!
//! The two high bits of a header id select its encoding:
//!
//! ```text
//! 00  unicode text   [id][len u16][UTF-16BE ... 0x0000]
//! 01  byte sequence  [id][len u16][bytes]
//! 10  one byte       [id][u8]
//! 11  four bytes     [id][u32 BE]
//! ```

use crate::error::ObexError;

pub const HI_COUNT: u8 = 0xC0;
pub const HI_NAME: u8 = 0x01;
pub const HI_TYPE: u8 = 0x42;
pub const HI_LENGTH: u8 = 0xC3;
pub const HI_DESCRIPTION: u8 = 0x05;
pub const HI_BODY: u8 = 0x48;
pub const HI_END_OF_BODY: u8 = 0x49;
pub const HI_CONNECTION_ID: u8 = 0xCB;

const ENCODING_MASK: u8 = 0xC0;
const ENC_BYTE: u8 = 0x80;
const ENC_U32: u8 = 0xC0;

/// Size of the id + length prefix of variable-length headers.
pub const VAR_HEADER_OVERHEAD: usize = 3;

/// The headers this implementation understands. Unknown headers are
/// skipped on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub length: Option<u32>,
    pub count: Option<u32>,
    pub description: Option<String>,
    pub connection_id: Option<u32>,
    pub body: Option<Vec<u8>>,
    /// Send `body` as End-of-Body.
    pub end_of_body: bool,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name, type and length of an object about to be pushed.
    pub fn object(name: impl Into<String>, mime_type: impl Into<String>, length: u32) -> Self {
        Self {
            name: Some(name.into()),
            mime_type: Some(mime_type.into()),
            length: Some(length),
            ..Self::default()
        }
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.connection_id.is_some() {
            len += 5;
        }
        if self.count.is_some() {
            len += 5;
        }
        if let Some(ref name) = self.name {
            len += unicode_len(name);
        }
        if let Some(ref mime) = self.mime_type {
            len += VAR_HEADER_OVERHEAD + mime.len() + 1;
        }
        if self.length.is_some() {
            len += 5;
        }
        if let Some(ref description) = self.description {
            len += unicode_len(description);
        }
        if let Some(ref body) = self.body {
            len += VAR_HEADER_OVERHEAD + body.len();
        }
        len
    }

    /// Appends the encoded headers to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ObexError> {
        if let Some(id) = self.connection_id {
            put_u32(out, HI_CONNECTION_ID, id);
        }
        if let Some(count) = self.count {
            put_u32(out, HI_COUNT, count);
        }
        if let Some(ref name) = self.name {
            put_unicode(out, HI_NAME, name)?;
        }
        if let Some(ref mime) = self.mime_type {
            let mut bytes = mime.as_bytes().to_vec();
            bytes.push(0);
            put_bytes(out, HI_TYPE, &bytes)?;
        }
        if let Some(length) = self.length {
            put_u32(out, HI_LENGTH, length);
        }
        if let Some(ref description) = self.description {
            put_unicode(out, HI_DESCRIPTION, description)?;
        }
        if let Some(ref body) = self.body {
            let id = if self.end_of_body {
                HI_END_OF_BODY
            } else {
                HI_BODY
            };
            put_bytes(out, id, body)?;
        }
        Ok(())
    }

    /// Decodes a header block.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ObexError> {
        let mut set = Self::default();
        while let Some((&id, rest)) = buf.split_first() {
            match id & ENCODING_MASK {
                ENC_BYTE => {
                    if rest.is_empty() {
                        return Err(truncated(id));
                    }
                    buf = &rest[1..];
                }
                ENC_U32 => {
                    let value = rest
                        .get(..4)
                        .ok_or_else(|| truncated(id))?
                        .try_into()
                        .map(u32::from_be_bytes)
                        .map_err(|_| truncated(id))?;
                    match id {
                        HI_COUNT => set.count = Some(value),
                        HI_LENGTH => set.length = Some(value),
                        HI_CONNECTION_ID => set.connection_id = Some(value),
                        _ => {}
                    }
                    buf = &rest[4..];
                }
                _ => {
                    let len_bytes: [u8; 2] = rest
                        .get(..2)
                        .ok_or_else(|| truncated(id))?
                        .try_into()
                        .map_err(|_| truncated(id))?;
                    let total = u16::from_be_bytes(len_bytes) as usize;
                    if total < VAR_HEADER_OVERHEAD || total - 1 > rest.len() {
                        return Err(truncated(id));
                    }
                    let value = &rest[2..total - 1];
                    match id {
                        HI_NAME => set.name = Some(decode_unicode(value)?),
                        HI_DESCRIPTION => set.description = Some(decode_unicode(value)?),
                        HI_TYPE => {
                            let text = value.strip_suffix(&[0]).unwrap_or(value);
                            set.mime_type = Some(
                                String::from_utf8(text.to_vec()).map_err(|e| {
                                    ObexError::Protocol(format!("invalid type header: {e}"))
                                })?,
                            );
                        }
                        HI_BODY => append_body(&mut set, value),
                        HI_END_OF_BODY => {
                            append_body(&mut set, value);
                            set.end_of_body = true;
                        }
                        _ => {}
                    }
                    buf = &rest[total - 1..];
                }
            }
        }
        Ok(set)
    }
}

fn append_body(set: &mut HeaderSet, value: &[u8]) {
    set.body
        .get_or_insert_with(Vec::new)
        .extend_from_slice(value);
}

fn truncated(id: u8) -> ObexError {
    ObexError::Protocol(format!("truncated header 0x{id:02X}"))
}

fn unicode_len(text: &str) -> usize {
    if text.is_empty() {
        VAR_HEADER_OVERHEAD
    } else {
        VAR_HEADER_OVERHEAD + (text.encode_utf16().count() + 1) * 2
    }
}

fn put_u32(out: &mut Vec<u8>, id: u8, value: u32) {
    out.push(id);
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(out: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<(), ObexError> {
    let total = VAR_HEADER_OVERHEAD + value.len();
    let total = u16::try_from(total).map_err(|_| ObexError::PacketTooLarge(total))?;
    out.push(id);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn put_unicode(out: &mut Vec<u8>, id: u8, text: &str) -> Result<(), ObexError> {
    // An empty name is sent without the terminating null.
    let mut bytes = Vec::with_capacity(text.len() * 2 + 2);
    if !text.is_empty() {
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
    }
    put_bytes(out, id, &bytes)
}

fn decode_unicode(value: &[u8]) -> Result<String, ObexError> {
    if value.len() % 2 != 0 {
        return Err(ObexError::Protocol("odd-length unicode header".into()));
    }
    let units: Vec<u16> = value
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16(&units)
        .map_err(|e| ObexError::Protocol(format!("invalid unicode header: {e}")))
}
