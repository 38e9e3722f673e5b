use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::filter::{Filter, Predicate};
use crate::path::ArchivePath;

use super::WireError;

pub const PROTOCOL: [u8; 9] = *b"meshvault";

const KIND_EVERYTHING: u8 = 0;
const KIND_NOTHING: u8 = 1;
const KIND_PREDICATES: u8 = 2;

/// The first thing exchanged on a fresh connection: which slice of the
/// archive the sender is interested in.
pub struct FilterHandshake {
    pub filter: Filter,
}

impl FilterHandshake {
    pub fn new(filter: Filter) -> Self {
        Self { filter }
    }
}

pub struct HandshakeCodec;

impl Encoder<FilterHandshake> for HandshakeCodec {
    type Error = WireError;

    fn encode(&mut self, item: FilterHandshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&PROTOCOL);

        match item.filter {
            Filter::Everything => dst.put_u8(KIND_EVERYTHING),
            Filter::Nothing => dst.put_u8(KIND_NOTHING),
            Filter::Predicates(predicates) => {
                dst.put_u8(KIND_PREDICATES);
                dst.put_u16(predicates.len() as u16);
                for predicate in predicates.iter() {
                    let raw = predicate.to_string();
                    dst.put_u16(raw.len() as u16);
                    dst.extend_from_slice(raw.as_bytes());
                }
            }
        }
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = FilterHandshake;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(&src[..]);
        let protocol_len = cursor.get_u8() as usize;
        if cursor.remaining() < protocol_len + 1 {
            return Ok(None);
        }

        let mut probe = cursor.clone();
        probe.advance(protocol_len);
        let kind = probe.get_u8();

        let needed = match kind {
            KIND_EVERYTHING | KIND_NOTHING => 0,
            KIND_PREDICATES => {
                if probe.remaining() < 2 {
                    return Ok(None);
                }
                let count = probe.get_u16() as usize;
                let mut total = 0usize;
                for _ in 0..count {
                    if probe.remaining() < 2 {
                        return Ok(None);
                    }
                    let len = probe.get_u16() as usize;
                    if probe.remaining() < len {
                        return Ok(None);
                    }
                    probe.advance(len);
                    total += 2 + len;
                }
                total
            }
            other => return Err(WireError::InvalidDiscriminant(other)),
        };
        let _ = needed;

        // Full frame is present; re-walk and actually consume it.
        src.advance(1 + protocol_len + 1);
        let filter = match kind {
            KIND_EVERYTHING => Filter::everything(),
            KIND_NOTHING => Filter::nothing(),
            KIND_PREDICATES => {
                let count = src.get_u16() as usize;
                let mut predicates = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = src.get_u16() as usize;
                    let mut buf = vec![0u8; len];
                    src.copy_to_slice(&mut buf);
                    let raw = String::from_utf8(buf)?;
                    predicates.push(
                        Predicate::new(raw)
                            .map_err(|e| WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
                    );
                }
                Filter::of(predicates)
            }
            other => return Err(WireError::InvalidDiscriminant(other)),
        };

        Ok(Some(FilterHandshake { filter }))
    }
}

/// Reads an `ArchivePath` off the wire as a u16 length prefix followed
/// by utf-8 bytes. Shared by the notice/request/data codecs.
pub(super) fn read_path(src: &mut impl Buf) -> Result<ArchivePath, WireError> {
    let len = src.get_u16() as usize;
    let mut buf = vec![0u8; len];
    src.copy_to_slice(&mut buf);
    Ok(ArchivePath::from_normalized(String::from_utf8(buf)?))
}

pub(super) fn write_path(dst: &mut BytesMut, path: &ArchivePath) {
    let bytes = path.as_str().as_bytes();
    dst.put_u16(bytes.len() as u16);
    dst.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_everything() {
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        codec
            .encode(FilterHandshake::new(Filter::everything()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.filter.satisfies_everything());
    }

    #[test]
    fn round_trips_predicates() {
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        let filter = Filter::of(vec![Predicate::new("a/*.bin").unwrap()]);
        codec
            .encode(FilterHandshake::new(filter), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.filter.includes(&ArchivePath::new("a/x.bin").unwrap()));
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL.len() as u8);
        buf.extend_from_slice(&PROTOCOL[..3]);
        let mut codec = HandshakeCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
