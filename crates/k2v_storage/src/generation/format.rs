//! On-disk layout of a generation file.
//!
//! ```text
//! header (40 bytes):
//!   magic "K2VG" | format u32 | first_version u64 | lineage tag [16] | flags u32 | crc32 u32
//! frame, repeated:
//!   body_len u64 | crc32(body) u32 | body
//! body:
//!   version u64 | op_count u32 | op*
//! op:
//!   1 Touch  path
//!   2 Put    path | key_len u32 | key | doc_len u64 | doc bytes
//!   3 Stamp  path | version u64 | absolute u8
//! path:
//!   count u32 | (len u32 | bytes)*
//! ```
//!
//! All integers are little-endian. Stamp ops are only written by compaction,
//! which restates each folder's version and authority explicitly.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};

pub(crate) const GEN_MAGIC: &[u8; 4] = b"K2VG";
pub(crate) const GEN_FORMAT_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: u64 = 40;
pub(crate) const FRAME_HEADER_SIZE: u64 = 12;
pub(crate) const BODY_PREFIX_SIZE: u64 = 12;

const FLAG_ABSOLUTE_ROOT: u32 = 1;

pub(crate) const OP_TOUCH: u8 = 1;
pub(crate) const OP_PUT: u8 = 2;
pub(crate) const OP_STAMP: u8 = 3;

fn slice_to_array<const N: usize>(slice: &[u8]) -> Result<[u8; N], String> {
    slice
        .try_into()
        .map_err(|_| "unexpected end of data".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub first_version: u64,
    /// Random tag shared by every generation of one store.
    pub tag: [u8; 16],
    /// The root folder is authoritative: nothing older exists.
    pub absolute_root: bool,
}

impl Header {
    pub fn lineage(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.tag[..8]);
        u64::from_le_bytes(word)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(GEN_MAGIC);
        buf[4..8].copy_from_slice(&GEN_FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_version.to_le_bytes());
        buf[16..32].copy_from_slice(&self.tag);
        let flags = if self.absolute_root { FLAG_ABSOLUTE_ROOT } else { 0 };
        buf[32..36].copy_from_slice(&flags.to_le_bytes());
        let crc = crc32fast::hash(&buf[..36]);
        buf[36..40].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(format!("header needs {} bytes, got {}", HEADER_SIZE, buf.len()));
        }
        if &buf[0..4] != GEN_MAGIC.as_slice() {
            return Err(format!("bad magic: {:02x?}", &buf[0..4]));
        }
        let stored_crc = u32::from_le_bytes(slice_to_array(&buf[36..40])?);
        let actual_crc = crc32fast::hash(&buf[..36]);
        if stored_crc != actual_crc {
            return Err(format!(
                "header checksum mismatch: stored={:#010x}, computed={:#010x}",
                stored_crc, actual_crc
            ));
        }
        let format = u32::from_le_bytes(slice_to_array(&buf[4..8])?);
        if format != GEN_FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {})",
                format, GEN_FORMAT_VERSION
            ));
        }
        let flags = u32::from_le_bytes(slice_to_array(&buf[32..36])?);
        Ok(Self {
            first_version: u64::from_le_bytes(slice_to_array(&buf[8..16])?),
            tag: slice_to_array(&buf[16..32])?,
            absolute_root: flags & FLAG_ABSOLUTE_ROOT != 0,
        })
    }
}

pub(crate) fn body_prefix(version: u64, op_count: u32) -> [u8; BODY_PREFIX_SIZE as usize] {
    let mut buf = [0u8; BODY_PREFIX_SIZE as usize];
    buf[0..8].copy_from_slice(&version.to_le_bytes());
    buf[8..12].copy_from_slice(&op_count.to_le_bytes());
    buf
}

/// Split a frame body into `(version, op_count, ops)`.
pub(crate) fn split_body(body: &[u8]) -> Result<(u64, u32, &[u8]), String> {
    if body.len() < BODY_PREFIX_SIZE as usize {
        return Err(format!("frame body of {} bytes has no prefix", body.len()));
    }
    let version = u64::from_le_bytes(slice_to_array(&body[0..8])?);
    let op_count = u32::from_le_bytes(slice_to_array(&body[8..12])?);
    Ok((version, op_count, &body[BODY_PREFIX_SIZE as usize..]))
}

pub(crate) fn decode_frame_header(buf: &[u8; FRAME_HEADER_SIZE as usize]) -> (u64, u32) {
    let mut len = [0u8; 8];
    len.copy_from_slice(&buf[0..8]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&buf[8..12]);
    (u64::from_le_bytes(len), u32::from_le_bytes(crc))
}

pub(crate) fn path_encoded_len(path: &[Vec<u8>]) -> u64 {
    4 + path.iter().map(|k| 4 + k.len() as u64).sum::<u64>()
}

/// Encoded size of the Stamp op that restates a folder.
pub(crate) fn stamp_size(path: &[Vec<u8>]) -> u64 {
    1 + path_encoded_len(path) + 8 + 1
}

/// Encoded size of the Put op that stores a document, bytes included.
pub(crate) fn put_size(path: &[Vec<u8>], key_len: usize, doc_len: u64) -> u64 {
    1 + path_encoded_len(path) + 4 + key_len as u64 + 8 + doc_len
}

fn encode_path(buf: &mut Vec<u8>, path: &[Vec<u8>]) {
    buf.extend_from_slice(&(path.len() as u32).to_le_bytes());
    for key in path {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
    }
}

pub(crate) fn encode_touch(buf: &mut Vec<u8>, path: &[Vec<u8>]) {
    buf.push(OP_TOUCH);
    encode_path(buf, path);
}

/// Encode a Put op up to (and including) the document length. Returns the
/// position of the length field so it can be patched once the document's
/// size is known.
pub(crate) fn encode_put_head(buf: &mut Vec<u8>, path: &[Vec<u8>], key: &[u8], doc_len: u64) -> usize {
    buf.push(OP_PUT);
    encode_path(buf, path);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    let len_at = buf.len();
    buf.extend_from_slice(&doc_len.to_le_bytes());
    len_at
}

pub(crate) fn encode_stamp(buf: &mut Vec<u8>, path: &[Vec<u8>], version: u64, absolute: bool) {
    buf.push(OP_STAMP);
    encode_path(buf, path);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.push(absolute as u8);
}

/// A decoded op. Put offsets are relative to the start of the op stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Op<'a> {
    Touch {
        path: Vec<Vec<u8>>,
    },
    Put {
        path: Vec<Vec<u8>>,
        key: &'a [u8],
        offset: u64,
        len: u64,
    },
    Stamp {
        path: Vec<Vec<u8>>,
        version: u64,
        absolute: bool,
    },
}

pub(crate) struct OpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> OpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| format!("op stream ends early at byte {}", self.pos))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(slice_to_array(self.take(4)?)?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(slice_to_array(self.take(8)?)?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], String> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn path(&mut self) -> Result<Vec<Vec<u8>>, String> {
        let count = self.u32()? as usize;
        // each component costs at least its length word
        if count > (self.buf.len() - self.pos) / 4 {
            return Err(format!("path of {} components overruns op stream", count));
        }
        let mut path = Vec::with_capacity(count);
        for _ in 0..count {
            path.push(self.bytes()?.to_vec());
        }
        Ok(path)
    }

    pub fn next_op(&mut self) -> Result<Op<'a>, String> {
        let tag_at = self.pos;
        match self.u8()? {
            OP_TOUCH => Ok(Op::Touch { path: self.path()? }),
            OP_PUT => {
                let path = self.path()?;
                let key = self.bytes()?;
                let len = self.u64()?;
                let offset = self.pos as u64;
                let len_usize = usize::try_from(len)
                    .map_err(|_| format!("document length {} does not fit in memory", len))?;
                self.take(len_usize)?;
                Ok(Op::Put {
                    path,
                    key,
                    offset,
                    len,
                })
            }
            OP_STAMP => {
                let path = self.path()?;
                let version = self.u64()?;
                let absolute = self.u8()? != 0;
                Ok(Op::Stamp {
                    path,
                    version,
                    absolute,
                })
            }
            other => Err(format!("unknown op tag {} at byte {}", other, tag_at)),
        }
    }
}

/// Streams one frame into `file` at `start`, checksumming as it goes. The
/// frame header is written last, so a frame interrupted midway reads back as
/// a zero-length (torn) frame.
pub(crate) struct FrameWriter<'f> {
    file: &'f File,
    out: BufWriter<&'f File>,
    start: u64,
    hasher: crc32fast::Hasher,
    body_len: u64,
}

impl<'f> FrameWriter<'f> {
    pub fn begin(file: &'f File, start: u64) -> io::Result<Self> {
        let mut handle = file;
        handle.seek(SeekFrom::Start(start))?;
        let mut out = BufWriter::with_capacity(64 * 1024, file);
        out.write_all(&[0u8; FRAME_HEADER_SIZE as usize])?;
        Ok(Self {
            file,
            out,
            start,
            hasher: crc32fast::Hasher::new(),
            body_len: 0,
        })
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.hasher.update(bytes);
        self.out.write_all(bytes)?;
        self.body_len += bytes.len() as u64;
        Ok(())
    }

    /// Patch the frame header. Returns the offset just past the frame.
    pub fn finish(mut self) -> io::Result<u64> {
        self.out.flush()?;
        drop(self.out);
        let crc = self.hasher.finalize();
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&self.body_len.to_le_bytes());
        header[8..12].copy_from_slice(&crc.to_le_bytes());
        let mut handle = self.file;
        handle.seek(SeekFrom::Start(self.start))?;
        handle.write_all(&header)?;
        Ok(self.start + FRAME_HEADER_SIZE + self.body_len)
    }
}
