//! Append-only, log-structured block serializer.
//!
//! Every write appends a checksummed frame; a [`BlockToken`] is the frame's
//! stable file offset, so historical images stay readable by token after the
//! block has been overwritten. Opening an existing store rebuilds the
//! latest-image index by scanning frames; a torn tail frame ends the scan and
//! is truncated away.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::serializer::{BlockToken, IoAccount, ReadAheadSink, Serializer, SerializerRead};
use crate::types::{BlockId, EspejoError, Recency, Result};

const FRAME_MAGIC: u16 = 0xE5E0;
const FRAME_HDR_LEN: usize = 28;

const KIND_IMAGE: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

mod hdr {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..2;
    pub const KIND: usize = 2;
    pub const RESERVED: usize = 3;
    pub const LEN: Range<usize> = 4..8;
    pub const BLOCK_ID: Range<usize> = 8..16;
    pub const RECENCY: Range<usize> = 16..24;
    pub const CRC32: Range<usize> = 24..28;
}

fn frame_crc32(block_id: u64, recency: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block_id.to_be_bytes());
    hasher.update(&recency.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

struct FrameHeader {
    kind: u8,
    len: u32,
    block_id: BlockId,
    recency: Recency,
    crc32: u32,
}

impl FrameHeader {
    fn encode(&self, dst: &mut [u8]) {
        dst[hdr::MAGIC].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        dst[hdr::KIND] = self.kind;
        dst[hdr::RESERVED] = 0;
        dst[hdr::LEN].copy_from_slice(&self.len.to_be_bytes());
        dst[hdr::BLOCK_ID].copy_from_slice(&self.block_id.0.to_be_bytes());
        dst[hdr::RECENCY].copy_from_slice(&self.recency.0.to_be_bytes());
        dst[hdr::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        let magic = u16::from_be_bytes(src[hdr::MAGIC].try_into().unwrap());
        if magic != FRAME_MAGIC {
            return Err(EspejoError::Corruption("bad frame magic"));
        }
        let kind = src[hdr::KIND];
        if kind != KIND_IMAGE && kind != KIND_TOMBSTONE {
            return Err(EspejoError::Corruption("unknown frame kind"));
        }
        if src[hdr::RESERVED] != 0 {
            return Err(EspejoError::Corruption("frame reserved byte not zero"));
        }
        Ok(Self {
            kind,
            len: u32::from_be_bytes(src[hdr::LEN].try_into().unwrap()),
            block_id: BlockId(u64::from_be_bytes(src[hdr::BLOCK_ID].try_into().unwrap())),
            recency: Recency(u64::from_be_bytes(src[hdr::RECENCY].try_into().unwrap())),
            crc32: u32::from_be_bytes(src[hdr::CRC32].try_into().unwrap()),
        })
    }
}

/// Positioned file I/O, platform-split the same way as the database file layer.
mod pos {
    use std::fs::File;
    use std::io::{self, ErrorKind};

    #[cfg(unix)]
    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes"));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "seek_write wrote zero bytes"));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Tuning knobs for [`LogSerializer`].
#[derive(Clone, Debug)]
pub struct LogSerializerOptions {
    /// Maximum block size in bytes.
    pub block_size: u32,
    /// Whether each write is fsynced before its token is returned.
    pub sync_writes: bool,
    /// How many successor blocks to offer to a registered read-ahead sink
    /// after serving a read. Zero disables read-ahead.
    pub read_ahead_window: usize,
}

impl Default for LogSerializerOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            sync_writes: true,
            read_ahead_window: 0,
        }
    }
}

#[derive(Copy, Clone)]
struct IndexEntry {
    offset: u64,
    len: u32,
    recency: Recency,
}

struct LogInner {
    index: HashMap<BlockId, IndexEntry>,
    append_offset: u64,
    max_block_id: BlockId,
}

/// Append-only file serializer. See the module docs for the on-disk shape.
pub struct LogSerializer {
    file: File,
    options: LogSerializerOptions,
    inner: Mutex<LogInner>,
    read_ahead: RwLock<Option<Arc<dyn ReadAheadSink>>>,
}

impl LogSerializer {
    /// Opens (or creates) a store at `path`, scanning existing frames to
    /// rebuild the latest-image index. A torn tail frame ends the scan and is
    /// truncated away.
    pub fn open(path: impl AsRef<Path>, options: LogSerializerOptions) -> Result<Self> {
        if options.block_size == 0 {
            return Err(EspejoError::Invalid("block size must be non-zero"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(EspejoError::from)?;
        let file_len = file.metadata().map_err(EspejoError::from)?.len();

        let mut index = HashMap::new();
        let mut max_block_id = BlockId(0);
        let mut offset = 0u64;
        let mut hdr_buf = [0u8; FRAME_HDR_LEN];
        while offset + FRAME_HDR_LEN as u64 <= file_len {
            if let Err(err) = pos::read_exact_at(&file, offset, &mut hdr_buf) {
                if err.kind() == ErrorKind::UnexpectedEof {
                    break;
                }
                return Err(EspejoError::from(err));
            }
            let header = match FrameHeader::decode(&hdr_buf) {
                Ok(header) => header,
                Err(_) => break, // torn tail
            };
            if header.len > options.block_size {
                break;
            }
            let payload_end = offset + FRAME_HDR_LEN as u64 + u64::from(header.len);
            if payload_end > file_len {
                break;
            }
            let mut payload = vec![0u8; header.len as usize];
            pos::read_exact_at(&file, offset + FRAME_HDR_LEN as u64, &mut payload)?;
            if frame_crc32(header.block_id.0, header.recency.0, &payload) != header.crc32 {
                break;
            }
            match header.kind {
                KIND_IMAGE => {
                    index.insert(
                        header.block_id,
                        IndexEntry {
                            offset,
                            len: header.len,
                            recency: header.recency,
                        },
                    );
                }
                _ => {
                    index.remove(&header.block_id);
                }
            }
            if header.block_id.0 >= max_block_id.0 {
                max_block_id = BlockId(header.block_id.0 + 1);
            }
            offset = payload_end;
        }
        if offset < file_len {
            warn!(
                valid_bytes = offset,
                file_bytes = file_len,
                "serializer.open.truncating_torn_tail"
            );
            file.set_len(offset).map_err(EspejoError::from)?;
        }
        debug!(
            blocks = index.len(),
            append_offset = offset,
            "serializer.open.index_rebuilt"
        );
        Ok(Self {
            file,
            options,
            inner: Mutex::new(LogInner {
                index,
                append_offset: offset,
                max_block_id,
            }),
            read_ahead: RwLock::new(None),
        })
    }

    fn read_frame_at(&self, offset: u64, account: &IoAccount) -> Result<(FrameHeader, Vec<u8>)> {
        let mut hdr_buf = [0u8; FRAME_HDR_LEN];
        pos::read_exact_at(&self.file, offset, &mut hdr_buf)?;
        let header = FrameHeader::decode(&hdr_buf)?;
        if header.len > self.options.block_size {
            return Err(EspejoError::Corruption("frame length exceeds block size"));
        }
        let mut payload = vec![0u8; header.len as usize];
        pos::read_exact_at(&self.file, offset + FRAME_HDR_LEN as u64, &mut payload)?;
        if frame_crc32(header.block_id.0, header.recency.0, &payload) != header.crc32 {
            return Err(EspejoError::Corruption("frame crc mismatch"));
        }
        account.charge(FRAME_HDR_LEN + payload.len());
        Ok((header, payload))
    }

    fn append_frame(
        &self,
        kind: u8,
        block_id: BlockId,
        recency: Recency,
        payload: &[u8],
        account: &IoAccount,
    ) -> Result<u64> {
        let mut buf = vec![0u8; FRAME_HDR_LEN + payload.len()];
        let header = FrameHeader {
            kind,
            len: payload.len() as u32,
            block_id,
            recency,
            crc32: frame_crc32(block_id.0, recency.0, payload),
        };
        header.encode(&mut buf[..FRAME_HDR_LEN]);
        buf[FRAME_HDR_LEN..].copy_from_slice(payload);

        // Reserve the offset under the index lock, write outside it. Frames
        // never overlap, so concurrent positioned writes are safe.
        let offset = {
            let mut inner = self.inner.lock();
            let offset = inner.append_offset;
            inner.append_offset += buf.len() as u64;
            offset
        };
        pos::write_all_at(&self.file, offset, &buf)?;
        if self.options.sync_writes {
            self.file.sync_data().map_err(EspejoError::from)?;
        }
        account.charge(buf.len());
        Ok(offset)
    }

    /// Offers up to `read_ahead_window` successor blocks to the registered
    /// sink. Best effort: I/O errors here only end the batch.
    fn offer_successors(&self, after: BlockId, account: &IoAccount) {
        let sink = match self.read_ahead.read().clone() {
            Some(sink) => sink,
            None => return,
        };
        for step in 1..=self.options.read_ahead_window as u64 {
            let candidate = BlockId(after.0 + step);
            let entry = match self.inner.lock().index.get(&candidate) {
                Some(entry) => *entry,
                None => continue,
            };
            match self.read_frame_at(entry.offset, account) {
                Ok((header, payload)) => {
                    sink.offer_read_ahead_buf(
                        candidate,
                        payload,
                        BlockToken(entry.offset),
                        header.recency,
                    );
                }
                Err(err) => {
                    debug!(block_id = candidate.0, %err, "serializer.read_ahead.abandoned");
                    return;
                }
            }
        }
    }
}

impl Serializer for LogSerializer {
    fn block_size(&self) -> u32 {
        self.options.block_size
    }

    fn max_block_id(&self) -> BlockId {
        self.inner.lock().max_block_id
    }

    fn read(&self, block_id: BlockId, account: &IoAccount) -> Result<SerializerRead> {
        let entry = {
            let inner = self.inner.lock();
            match inner.index.get(&block_id) {
                Some(entry) => *entry,
                None => return Err(EspejoError::NotFound),
            }
        };
        let (header, payload) = self.read_frame_at(entry.offset, account)?;
        if header.block_id != block_id {
            return Err(EspejoError::Corruption("frame block id mismatch"));
        }
        debug_assert_eq!(payload.len(), entry.len as usize);
        self.offer_successors(block_id, account);
        Ok(SerializerRead {
            data: payload,
            token: BlockToken(entry.offset),
            recency: header.recency,
        })
    }

    fn read_token(&self, token: BlockToken, account: &IoAccount) -> Result<Vec<u8>> {
        let (header, payload) = self.read_frame_at(token.0, account)?;
        if header.kind != KIND_IMAGE {
            return Err(EspejoError::Corruption("token does not reference an image"));
        }
        Ok(payload)
    }

    fn write(
        &self,
        block_id: BlockId,
        data: &[u8],
        recency: Recency,
        account: &IoAccount,
    ) -> Result<BlockToken> {
        if data.len() > self.options.block_size as usize {
            return Err(EspejoError::Invalid("write exceeds block size"));
        }
        let offset = self.append_frame(KIND_IMAGE, block_id, recency, data, account)?;
        let mut inner = self.inner.lock();
        inner.index.insert(
            block_id,
            IndexEntry {
                offset,
                len: data.len() as u32,
                recency,
            },
        );
        if block_id.0 >= inner.max_block_id.0 {
            inner.max_block_id = BlockId(block_id.0 + 1);
        }
        Ok(BlockToken(offset))
    }

    fn delete(&self, block_id: BlockId, account: &IoAccount) -> Result<()> {
        self.append_frame(KIND_TOMBSTONE, block_id, Recency(0), &[], account)?;
        self.inner.lock().index.remove(&block_id);
        Ok(())
    }

    fn recency(&self, block_id: BlockId) -> Result<Recency> {
        match self.inner.lock().index.get(&block_id) {
            Some(entry) => Ok(entry.recency),
            None => Err(EspejoError::NotFound),
        }
    }

    fn contains(&self, block_id: BlockId) -> bool {
        self.inner.lock().index.contains_key(&block_id)
    }

    fn register_read_ahead(&self, sink: Arc<dyn ReadAheadSink>) {
        *self.read_ahead.write() = Some(sink);
    }

    fn unregister_read_ahead(&self) {
        *self.read_ahead.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> LogSerializer {
        LogSerializer::open(
            dir.path().join("blocks.log"),
            LogSerializerOptions {
                block_size: 64,
                sync_writes: false,
                read_ahead_window: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let account = IoAccount::new(0);

        let token = store
            .write(BlockId(3), b"hello", Recency(7), &account)
            .unwrap();
        let read = store.read(BlockId(3), &account).unwrap();
        assert_eq!(read.data, b"hello");
        assert_eq!(read.token, token);
        assert_eq!(read.recency, Recency(7));
        assert_eq!(store.max_block_id(), BlockId(4));
    }

    #[test]
    fn token_survives_overwrite() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let account = IoAccount::new(0);

        let old = store
            .write(BlockId(1), b"first", Recency(1), &account)
            .unwrap();
        store
            .write(BlockId(1), b"second", Recency(2), &account)
            .unwrap();
        assert_eq!(store.read_token(old, &account).unwrap(), b"first");
        assert_eq!(store.read(BlockId(1), &account).unwrap().data, b"second");
    }

    #[test]
    fn delete_then_read_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let account = IoAccount::new(0);

        store
            .write(BlockId(9), b"doomed", Recency(1), &account)
            .unwrap();
        store.delete(BlockId(9), &account).unwrap();
        assert!(!store.contains(BlockId(9)));
        assert!(matches!(
            store.read(BlockId(9), &account),
            Err(EspejoError::NotFound)
        ));
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        let account = IoAccount::new(0);
        let options = LogSerializerOptions {
            block_size: 64,
            sync_writes: false,
            read_ahead_window: 0,
        };
        {
            let store = LogSerializer::open(&path, options.clone()).unwrap();
            store
                .write(BlockId(0), b"zero", Recency(1), &account)
                .unwrap();
            store
                .write(BlockId(5), b"five", Recency(2), &account)
                .unwrap();
            store.delete(BlockId(0), &account).unwrap();
        }
        let store = LogSerializer::open(&path, options).unwrap();
        assert!(!store.contains(BlockId(0)));
        assert_eq!(store.read(BlockId(5), &account).unwrap().data, b"five");
        assert_eq!(store.max_block_id(), BlockId(6));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        let account = IoAccount::new(0);
        let options = LogSerializerOptions {
            block_size: 64,
            sync_writes: false,
            read_ahead_window: 0,
        };
        {
            let store = LogSerializer::open(&path, options.clone()).unwrap();
            store
                .write(BlockId(1), b"keep", Recency(1), &account)
                .unwrap();
        }
        // Garbage past the last complete frame.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 11]).unwrap();
        }
        let store = LogSerializer::open(&path, options).unwrap();
        assert_eq!(store.read(BlockId(1), &account).unwrap().data, b"keep");
    }

    #[test]
    fn read_ahead_offers_indexed_successors() {
        struct Collector {
            seen: PlMutex<Vec<(BlockId, Vec<u8>)>>,
        }
        impl ReadAheadSink for Collector {
            fn offer_read_ahead_buf(
                &self,
                block_id: BlockId,
                data: Vec<u8>,
                _token: BlockToken,
                _recency: Recency,
            ) {
                self.seen.lock().push((block_id, data));
            }
        }

        let dir = tempdir().unwrap();
        let store = LogSerializer::open(
            dir.path().join("blocks.log"),
            LogSerializerOptions {
                block_size: 64,
                sync_writes: false,
                read_ahead_window: 2,
            },
        )
        .unwrap();
        let account = IoAccount::new(0);
        for id in 0..4u64 {
            store
                .write(BlockId(id), &[id as u8; 4], Recency(id), &account)
                .unwrap();
        }
        let collector = Arc::new(Collector {
            seen: PlMutex::new(Vec::new()),
        });
        store.register_read_ahead(collector.clone());
        store.read(BlockId(0), &account).unwrap();
        let seen = collector.seen.lock();
        assert_eq!(
            seen.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![BlockId(1), BlockId(2)]
        );
        assert_eq!(seen[0].1, vec![1u8; 4]);
    }

    #[test]
    fn accounts_are_charged_per_operation() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let reads = IoAccount::new(1);
        let writes = IoAccount::new(-1);

        store
            .write(BlockId(0), b"payload", Recency(1), &writes)
            .unwrap();
        store.read(BlockId(0), &reads).unwrap();
        assert_eq!(writes.ops(), 1);
        assert_eq!(reads.ops(), 1);
        assert!(reads.bytes() >= 7);
    }
}
