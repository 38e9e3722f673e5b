use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::piece::{FileInfo, FilePieceSpecSet, Piece, PieceSpec};

use super::handshake::{read_path, write_path};
use super::WireError;

const ADDITION: u8 = 0;
const REMOVED_FILE: u8 = 1;
const REMOVED_FILES: u8 = 2;

const ALL: u8 = 0;
const SOME: u8 = 1;

/// Messages exchanged on a peer's notice stream: what has appeared or
/// disappeared from the sender's archive.
#[derive(Debug, Clone)]
pub enum NoticeMessage {
    Addition(FilePieceSpecSet),
    RemovedFile(crate::piece::FileId),
    RemovedFiles(Vec<crate::piece::FileId>),
}

pub struct NoticeCodec;

fn write_file_info(dst: &mut BytesMut, info: &FileInfo) {
    write_path(dst, &info.id);
    dst.put_u64(info.file_size);
    dst.put_u64(info.piece_size);
}

fn read_file_info(src: &mut BytesMut) -> Result<FileInfo, WireError> {
    let id = read_path(src)?;
    let file_size = src.get_u64();
    let piece_size = src.get_u64();
    Ok(FileInfo::new(id, file_size, piece_size))
}

impl Encoder<NoticeMessage> for NoticeCodec {
    type Error = WireError;

    fn encode(&mut self, msg: NoticeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match msg {
            NoticeMessage::Addition(set) => {
                body.put_u8(ADDITION);
                match set {
                    FilePieceSpecSet::All(info) => {
                        write_file_info(&mut body, &info);
                        body.put_u8(ALL);
                    }
                    FilePieceSpecSet::Some { file_info, indexes } => {
                        write_file_info(&mut body, &file_info);
                        body.put_u8(SOME);
                        let raw = indexes.as_raw_slice();
                        body.put_u32(raw.len() as u32);
                        body.extend_from_slice(raw);
                    }
                }
            }
            NoticeMessage::RemovedFile(id) => {
                body.put_u8(REMOVED_FILE);
                write_path(&mut body, &id);
            }
            NoticeMessage::RemovedFiles(ids) => {
                body.put_u8(REMOVED_FILES);
                body.put_u32(ids.len() as u32);
                for id in &ids {
                    write_path(&mut body, id);
                }
            }
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for NoticeCodec {
    type Item = NoticeMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);

        let msg = match src.get_u8() {
            ADDITION => {
                let file_info = read_file_info(src)?;
                let kind = src.get_u8();
                let set = match kind {
                    ALL => FilePieceSpecSet::all(file_info),
                    SOME => {
                        let byte_len = src.get_u32() as usize;
                        let mut raw = vec![0u8; byte_len];
                        src.copy_to_slice(&mut raw);
                        let piece_count = file_info.piece_count() as usize;
                        let mut indexes = bitvec::prelude::BitVec::from_vec(raw);
                        indexes.truncate(piece_count);
                        FilePieceSpecSet::Some { file_info, indexes }
                    }
                    other => return Err(WireError::InvalidDiscriminant(other)),
                };
                NoticeMessage::Addition(set)
            }
            REMOVED_FILE => NoticeMessage::RemovedFile(read_path(src)?),
            REMOVED_FILES => {
                let count = src.get_u32() as usize;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(read_path(src)?);
                }
                NoticeMessage::RemovedFiles(ids)
            }
            other => return Err(WireError::InvalidDiscriminant(other)),
        };
        Ok(Some(msg))
    }
}

/// A request for a single piece, sent on a peer's request stream.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub spec: PieceSpec,
}

pub struct RequestCodec;

impl Encoder<RequestMessage> for RequestCodec {
    type Error = WireError;

    fn encode(&mut self, msg: RequestMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        write_file_info(&mut body, &msg.spec.file_info);
        body.put_u32(msg.spec.index);
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for RequestCodec {
    type Item = RequestMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let file_info = read_file_info(src)?;
        let index = src.get_u32();
        let spec = PieceSpec::new(file_info, index).map_err(|e| {
            WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Some(RequestMessage { spec }))
    }
}

/// A piece's bytes, sent on a peer's data stream in reply to a
/// `RequestMessage`.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub piece: Piece,
}

pub struct DataCodec;

impl Encoder<DataMessage> for DataCodec {
    type Error = WireError;

    fn encode(&mut self, msg: DataMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        write_file_info(&mut body, &msg.piece.spec.file_info);
        body.put_u32(msg.piece.spec.index);
        body.put_i64(msg.piece.time_to_live);
        body.put_u32(msg.piece.bytes.len() as u32);
        body.extend_from_slice(&msg.piece.bytes);
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for DataCodec {
    type Item = DataMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let file_info = read_file_info(src)?;
        let index = src.get_u32();
        let ttl = src.get_i64();
        let data_len = src.get_u32() as usize;
        let mut bytes = vec![0u8; data_len];
        src.copy_to_slice(&mut bytes);

        let spec = PieceSpec::new(file_info, index).map_err(|e| {
            WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let piece = Piece::new(spec, bytes, ttl)
            .map_err(|e| WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(Some(DataMessage { piece }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArchivePath;

    fn info() -> FileInfo {
        FileInfo::new(ArchivePath::new("a/b.bin").unwrap(), 16, 8)
    }

    #[test]
    fn notice_addition_all_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = NoticeCodec;
        codec
            .encode(NoticeMessage::Addition(FilePieceSpecSet::all(info())), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, NoticeMessage::Addition(FilePieceSpecSet::All(_))));
    }

    #[test]
    fn notice_addition_partial_round_trips_indexes() {
        let mut buf = BytesMut::new();
        let mut codec = NoticeCodec;
        let set = FilePieceSpecSet::single(info(), 1);
        codec.encode(NoticeMessage::Addition(set), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            NoticeMessage::Addition(set) => {
                assert!(set.contains(1));
                assert!(!set.contains(0));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn removed_file_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = NoticeCodec;
        let id = ArchivePath::new("x.bin").unwrap();
        codec
            .encode(NoticeMessage::RemovedFile(id.clone()), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, NoticeMessage::RemovedFile(got) if got == id));
    }

    #[test]
    fn request_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = RequestCodec;
        let spec = PieceSpec::new(info(), 1).unwrap();
        codec
            .encode(RequestMessage { spec: spec.clone() }, &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.spec, spec);
    }

    #[test]
    fn data_round_trips_piece_bytes() {
        let mut buf = BytesMut::new();
        let mut codec = DataCodec;
        let spec = PieceSpec::new(info(), 0).unwrap();
        let piece = Piece::new(spec, vec![7; 8], -1).unwrap();
        codec
            .encode(DataMessage { piece: piece.clone() }, &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.piece.bytes, piece.bytes);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.extend_from_slice(&[0; 3]);
        let mut codec = RequestCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
