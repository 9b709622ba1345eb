//! Block codec workloads.
//!
//! A run-length encoder with a CRC-32 per block, used two ways: one call over
//! the whole buffer, and a streaming writer that frames `block.size` chunks.
//! Inputs are sized by `byte.size`.

use forkbench::prelude::*;
use std::io::{self, Write};

const DEFAULT_BYTE_SIZE: usize = 1024 * 1024;
const DEFAULT_BLOCK_SIZE: usize = 1 << 16;
const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// CRC-32 (IEEE) lookup table, built once per fork
pub struct CodecTables {
    crc: [u32; 256],
}

impl CodecTables {
    fn build() -> Self {
        let mut crc = [0u32; 256];
        for (i, slot) in crc.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            }
            *slot = c;
        }
        Self { crc }
    }

    fn checksum(&self, data: &[u8]) -> u32 {
        !data.iter().fold(!0u32, |c, &b| {
            self.crc[((c ^ b as u32) & 0xff) as usize] ^ (c >> 8)
        })
    }
}

impl Fixture for CodecTables {
    const SCOPE: Scope = Scope::Benchmark;

    fn setup(_: &Params) -> Result<Self, FixtureError> {
        Ok(Self::build())
    }
}

/// Input buffer, one per worker thread
pub struct Payload(Vec<u8>);

impl Fixture for Payload {
    const SCOPE: Scope = Scope::Thread;

    fn setup(params: &Params) -> Result<Self, FixtureError> {
        let size: usize = params.parse_or("byte.size", DEFAULT_BYTE_SIZE)?;
        // Runs of eight equal bytes
        let data = (0..size).map(|i| (i / 8 % 251) as u8).collect();
        Ok(Payload(data))
    }
}

/// Frame size of the streaming writer
pub struct BlockSize(usize);

impl Fixture for BlockSize {
    const SCOPE: Scope = Scope::Benchmark;

    fn setup(params: &Params) -> Result<Self, FixtureError> {
        let size: usize = params.parse_or("block.size", DEFAULT_BLOCK_SIZE)?;
        if size == 0 || size > MAX_BLOCK_SIZE {
            return Err(FixtureError::setup(format!(
                "block.size must be between 1 and {MAX_BLOCK_SIZE}, got {size}"
            )));
        }
        Ok(BlockSize(size))
    }
}

/// Append `(run length, byte)` pairs for `input` to `out`
fn rle_encode(input: &[u8], out: &mut Vec<u8>) {
    let mut iter = input.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        let mut run: u8 = 1;
        while run < u8::MAX && iter.peek() == Some(&byte) {
            iter.next();
            run += 1;
        }
        out.push(run);
        out.push(byte);
    }
}

/// Writer that buffers `block_size` bytes and emits framed, encoded blocks.
///
/// Frame: raw length (u32 LE), encoded length (u32 LE), CRC-32 of the raw
/// block (u32 LE), encoded bytes.
pub struct BlockWriter<'t, W: Write> {
    inner: W,
    tables: &'t CodecTables,
    block_size: usize,
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl<'t, W: Write> BlockWriter<'t, W> {
    pub fn new(inner: W, tables: &'t CodecTables, block_size: usize) -> Self {
        Self {
            inner,
            tables,
            block_size,
            pending: Vec::with_capacity(block_size),
            scratch: Vec::with_capacity(block_size * 2),
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.scratch.clear();
        rle_encode(&self.pending, &mut self.scratch);

        let raw_len = u32::try_from(self.pending.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;
        let encoded_len = u32::try_from(self.scratch.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too large"))?;
        self.inner.write_all(&raw_len.to_le_bytes())?;
        self.inner.write_all(&encoded_len.to_le_bytes())?;
        self.inner
            .write_all(&self.tables.checksum(&self.pending).to_le_bytes())?;
        self.inner.write_all(&self.scratch)?;
        self.pending.clear();
        Ok(())
    }

    /// Flush the last partial block and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlockWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.pending.len();
        let take = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..take]);
        if self.pending.len() == self.block_size {
            self.flush_block()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[forkbench::bench(
    id = "codec::encode_bytes",
    group = "codec",
    mode = "avgt",
    unit = "ms",
    warmup = 2,
    iterations = 3,
    forks = 1,
    params = ["byte.size=1048576,4194304"]
)]
fn encode_bytes(tables: &CodecTables, payload: &Payload) -> (usize, u32) {
    let mut out = Vec::with_capacity(payload.0.len());
    rle_encode(&payload.0, &mut out);
    (out.len(), tables.checksum(&payload.0))
}

#[forkbench::bench(
    id = "codec::encode_stream",
    group = "codec",
    mode = "avgt",
    unit = "ms",
    warmup = 2,
    iterations = 3,
    forks = 1,
    params = ["byte.size=1048576,4194304", "block.size=65536,262144"]
)]
fn encode_stream(
    tables: &CodecTables,
    payload: &Payload,
    block: &BlockSize,
) -> io::Result<usize> {
    let mut writer = BlockWriter::new(Vec::new(), tables, block.0);
    writer.write_all(&payload.0)?;
    Ok(writer.finish()?.len())
}
