//! Record wire format and the per-storage reader strategy.
//!
//! A stored record occupies `block_count · BLOCK_SIZE` bytes:
//!
//! ```text
//! u32  block count      (self-describing)
//! u32  storage id
//! ...  reader-specific payload
//! u8   checksum         (XOR of all preceding bytes)
//! ...  zero padding up to the block boundary
//! ```
//!
//! The core treats the payload as opaque; the [`RecordReader`] bound to a
//! storage is the only party that knows how to delimit and interpret it.

use bytes::{BufMut, Bytes, BytesMut};
use common::{BlockPos, Record, StorageId, StoreError, StoreResult};
use pagefile::DataPage;

use crate::BLOCK_SIZE;

/// Bytes of a stored record not available to the payload: the two-word
/// prefix plus the trailing checksum.
pub const RECORD_OVERHEAD: usize = 9;

const RECORD_PREFIX: usize = 8;

/// Per-storage strategy for parsing a record payload.
///
/// `read` is called with the cursor positioned just after the 8-byte
/// prefix and must return the payload bytes exactly as they sit on disk,
/// leaving the cursor on the checksum byte.
pub trait RecordReader: Send + Sync {
    fn read(&self, page: &mut DataPage) -> StoreResult<Bytes>;
}

/// Default reader for payloads framed with a leading big-endian length.
pub struct LenPrefixReader;

impl LenPrefixReader {
    /// Frame raw bytes into a payload this reader can parse back.
    pub fn wrap(data: &[u8]) -> Bytes {
        let mut framed = BytesMut::with_capacity(4 + data.len());
        framed.put_u32(data.len() as u32);
        framed.put_slice(data);
        framed.freeze()
    }

    /// Strip the length frame from a payload produced by [`Self::wrap`].
    pub fn unwrap(payload: &[u8]) -> StoreResult<Bytes> {
        if payload.len() < 4 {
            return Err(StoreError::InvalidParameter(format!(
                "payload of {} bytes has no length frame",
                payload.len()
            )));
        }
        let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        if payload.len() != 4 + len {
            return Err(StoreError::InvalidParameter(format!(
                "length frame says {len} bytes, payload has {}",
                payload.len() - 4
            )));
        }
        Ok(Bytes::copy_from_slice(&payload[4..]))
    }
}

impl RecordReader for LenPrefixReader {
    fn read(&self, page: &mut DataPage) -> StoreResult<Bytes> {
        let len = page.read_u32()? as usize;
        // the checksum byte must still follow the payload
        if len + 1 > page.remaining() {
            return Err(StoreError::Corrupted(format!(
                "payload length {len} exceeds the allocated blocks"
            )));
        }
        let data = page.read_bytes(len)?;
        let mut framed = BytesMut::with_capacity(4 + len);
        framed.put_u32(len as u32);
        framed.put_slice(data);
        Ok(framed.freeze())
    }
}

/// Blocks needed to store a payload of `payload_len` bytes.
pub(crate) fn blocks_for(payload_len: usize) -> u32 {
    (RECORD_OVERHEAD + payload_len).div_ceil(BLOCK_SIZE) as u32
}

/// Serialize a record into its zero-padded block range image.
pub(crate) fn record_image(record: &Record) -> StoreResult<Vec<u8>> {
    let mut page = DataPage::new(record.block_count as usize * BLOCK_SIZE);
    page.write_u32(record.block_count)?;
    page.write_u32(record.storage_id.0)?;
    page.write_bytes(&record.payload)?;
    let sum = page.xor_checksum(0..RECORD_PREFIX + record.payload.len());
    page.write_u8(sum)?;
    Ok(page.into_data())
}

/// Parse a record starting at the cursor, verifying the prefix and the
/// checksum.
pub(crate) fn parse_record(
    page: &mut DataPage,
    reader: &dyn RecordReader,
    expected: StorageId,
    pos: BlockPos,
) -> StoreResult<Record> {
    let block_count = page.read_u32()?;
    let storage_id = page.read_u32()?;
    if storage_id != expected.0 {
        return Err(StoreError::Corrupted(format!(
            "record at block {pos} belongs to storage {storage_id}, expected {}",
            expected.0
        )));
    }
    if block_count == 0 || block_count as usize * BLOCK_SIZE > page.len() {
        return Err(StoreError::Corrupted(format!(
            "record at block {pos} claims {block_count} blocks"
        )));
    }
    let payload = reader.read(page)?;
    let stored = page.read_u8()?;
    let computed = page.xor_checksum(0..RECORD_PREFIX + payload.len());
    if stored != computed {
        return Err(StoreError::Corrupted(format!(
            "checksum mismatch at block {pos}: stored {stored:#04x}, computed {computed:#04x}"
        )));
    }
    Ok(Record {
        storage_id: expected,
        pos,
        block_count,
        deleted: false,
        changed: false,
        payload,
    })
}
