use anyhow::{Context, Result};
use likely_stable::unlikely;
use rand::RngCore;

use crate::remote_fs::RemoteStream;

/// Magic prefix of an object container file.
const CONTAINER_MAGIC: &[u8; 4] = b"Obj\x01";

/// Length of the block sync marker.
const SYNC_MARKER_LEN: usize = 16;

/// Writer for the object container format over pre-encoded records.
///
/// The file starts with a header: the magic, a metadata map carrying the
/// schema and the `null` codec, and a random sync marker. Records are
/// buffered and written as a block only on an explicit `sync()`, so
/// readers observe block boundaries exactly at the sink's chosen
/// durability points. There is no automatic flushing.
pub struct ContainerWriter<S: RemoteStream> {
    stream: S,
    sync_marker: [u8; SYNC_MARKER_LEN],

    /// Encoded records of the block under construction.
    pending: Vec<u8>,

    /// Number of records in `pending`.
    pending_records: u64,
}

impl<S: RemoteStream> ContainerWriter<S> {
    /// Open a writer over `stream`, writing the container header.
    pub fn new(mut stream: S, schema_json: &str) -> Result<Self> {
        let mut sync_marker = [0u8; SYNC_MARKER_LEN];
        rand::rng().fill_bytes(&mut sync_marker);

        let mut header = Vec::with_capacity(128 + schema_json.len());
        header.extend_from_slice(CONTAINER_MAGIC);
        encode_long(&mut header, 2);
        encode_bytes(&mut header, b"avro.schema");
        encode_bytes(&mut header, schema_json.as_bytes());
        encode_bytes(&mut header, b"avro.codec");
        encode_bytes(&mut header, b"null");
        encode_long(&mut header, 0);
        header.extend_from_slice(&sync_marker);

        stream
            .write_all(&header)
            .context("failed to write container header")?;

        Ok(Self {
            stream,
            sync_marker,
            pending: Vec::new(),
            pending_records: 0,
        })
    }

    /// Append one pre-encoded record to the block under construction.
    ///
    /// Buffered in memory; remote failures surface at the next `sync()`
    /// or `hsync()`.
    pub fn append_encoded(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        self.pending_records += 1;
    }

    /// Number of records buffered since the last block boundary.
    pub fn pending_records(&self) -> u64 {
        self.pending_records
    }

    /// Close the current block so readers see a boundary at this point.
    ///
    /// A sync with nothing pending writes nothing.
    pub fn sync(&mut self) -> Result<()> {
        if unlikely(self.pending_records == 0) {
            return Ok(());
        }

        let mut block = Vec::with_capacity(self.pending.len() + 24);
        encode_long(&mut block, self.pending_records as i64);
        encode_long(&mut block, self.pending.len() as i64);
        block.extend_from_slice(&self.pending);
        block.extend_from_slice(&self.sync_marker);

        self.stream
            .write_all(&block)
            .context("failed to write container block")?;

        self.pending.clear();
        self.pending_records = 0;

        Ok(())
    }

    /// Force persistence of everything written so far.
    pub fn hsync(&mut self) -> Result<()> {
        self.stream.hsync()
    }

    /// Write the final block and close the underlying stream.
    pub fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.stream.close()
    }
}

/// Zigzag varint encoding of a long, as the container block framing
/// expects it.
fn encode_long(out: &mut Vec<u8>, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;

    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;

        if n == 0 {
            out.push(byte);
            break;
        }

        out.push(byte | 0x80);
    }
}

/// Length-prefixed byte sequence.
fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_long(out, bytes.len() as i64);
    out.extend_from_slice(bytes);
}
