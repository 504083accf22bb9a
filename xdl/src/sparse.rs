// SPDX-License-Identifier: BSD-3-Clause
//! Android Sparse image codec.
//!
//! Two jobs: a strict parser/expander for existing sparse files, and a
//! splitter that turns large raw or sparse inputs into a sequence of
//! protocol-sized sparse pieces. Every piece after the first opens with a
//! DONT_CARE chunk carrying the absolute block offset, so a bootloader that
//! restarts its write cursor at zero for each download still lands every
//! byte on the right block.

use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, ImageError, Result};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const FILE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    fn for_image(blk_sz: u32, total_blks: u32, total_chunks: u32) -> Self {
        Self {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: FILE_HEADER_LEN as u16,
            chunk_hdr_sz: CHUNK_HEADER_LEN as u16,
            blk_sz,
            total_blks,
            total_chunks,
            image_checksum: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved: u16,
    /// Blocks this chunk covers on the target
    pub chunk_sz: u32,
    /// Bytes in the file, chunk header included
    pub total_sz: u32,
}

/// One parsed chunk, data left in place (`data_off` points into the source).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkDesc {
    Raw { blocks: u32, data_off: u64 },
    Fill { blocks: u32, pattern: [u8; 4] },
    DontCare { blocks: u32 },
    Crc32 { value: u32 },
}

impl ChunkDesc {
    pub fn blocks(&self) -> u32 {
        match *self {
            ChunkDesc::Raw { blocks, .. }
            | ChunkDesc::Fill { blocks, .. }
            | ChunkDesc::DontCare { blocks } => blocks,
            ChunkDesc::Crc32 { .. } => 0,
        }
    }
}

fn inconsistent(msg: impl Into<String>) -> Error {
    ImageError::InconsistentChunks(msg.into()).into()
}

/// Strict parser for one sparse file.
pub struct SparseReader<R> {
    src: R,
    header: SparseHeader,
    chunks: Vec<ChunkDesc>,
}

impl<R: Read + Seek> SparseReader<R> {
    /// Parse and fully validate: header layout, per-chunk size arithmetic,
    /// and the block-count total must all line up.
    pub fn open(mut src: R) -> Result<Self> {
        src.seek(SeekFrom::Start(0))?;

        let mut hdr_bytes = [0u8; FILE_HEADER_LEN];
        src.read_exact(&mut hdr_bytes)
            .map_err(|_| inconsistent("file shorter than the sparse header"))?;
        let header: SparseHeader = bincode::deserialize(&hdr_bytes)
            .map_err(|e| inconsistent(format!("undecodable header: {e}")))?;

        if header.magic != SPARSE_MAGIC {
            return Err(ImageError::BadSparseMagic(header.magic).into());
        }
        if header.major_version != 1 {
            return Err(inconsistent(format!(
                "unsupported sparse version {}.{}",
                header.major_version, header.minor_version
            )));
        }
        if (header.file_hdr_sz as usize) < FILE_HEADER_LEN
            || header.chunk_hdr_sz as usize != CHUNK_HEADER_LEN
        {
            return Err(inconsistent("unexpected header sizes"));
        }
        if header.blk_sz == 0 || header.blk_sz % 4 != 0 {
            return Err(inconsistent(format!("bad block size {}", header.blk_sz)));
        }

        // Vendor tools occasionally pad the file header; skip the extra.
        if header.file_hdr_sz as usize > FILE_HEADER_LEN {
            src.seek(SeekFrom::Start(header.file_hdr_sz as u64))?;
        }

        let mut chunks = Vec::with_capacity(header.total_chunks as usize);
        let mut covered_blocks: u64 = 0;
        for idx in 0..header.total_chunks {
            let mut ch_bytes = [0u8; CHUNK_HEADER_LEN];
            src.read_exact(&mut ch_bytes)
                .map_err(|_| inconsistent(format!("chunk {idx} header truncated")))?;
            let ch: ChunkHeader = bincode::deserialize(&ch_bytes)
                .map_err(|e| inconsistent(format!("chunk {idx}: {e}")))?;

            let body = ch.total_sz as u64;
            let expect_body = |want: u64| -> Result<()> {
                if body != CHUNK_HEADER_LEN as u64 + want {
                    Err(inconsistent(format!(
                        "chunk {idx} declares {body} bytes, expected {}",
                        CHUNK_HEADER_LEN as u64 + want
                    )))
                } else {
                    Ok(())
                }
            };

            let desc = match ch.chunk_type {
                CHUNK_TYPE_RAW => {
                    expect_body(ch.chunk_sz as u64 * header.blk_sz as u64)?;
                    let data_off = src.stream_position()?;
                    src.seek(SeekFrom::Current(ch.chunk_sz as i64 * header.blk_sz as i64))?;
                    ChunkDesc::Raw {
                        blocks: ch.chunk_sz,
                        data_off,
                    }
                }
                CHUNK_TYPE_FILL => {
                    expect_body(4)?;
                    let mut pattern = [0u8; 4];
                    src.read_exact(&mut pattern)
                        .map_err(|_| inconsistent(format!("chunk {idx} fill pattern truncated")))?;
                    ChunkDesc::Fill {
                        blocks: ch.chunk_sz,
                        pattern,
                    }
                }
                CHUNK_TYPE_DONT_CARE => {
                    expect_body(0)?;
                    ChunkDesc::DontCare {
                        blocks: ch.chunk_sz,
                    }
                }
                CHUNK_TYPE_CRC32 => {
                    expect_body(4)?;
                    let mut v = [0u8; 4];
                    src.read_exact(&mut v)
                        .map_err(|_| inconsistent(format!("chunk {idx} crc truncated")))?;
                    ChunkDesc::Crc32 {
                        value: u32::from_le_bytes(v),
                    }
                }
                other => {
                    return Err(inconsistent(format!(
                        "chunk {idx} has unknown type {other:#06x}"
                    )));
                }
            };

            covered_blocks += desc.blocks() as u64;
            chunks.push(desc);
        }

        if covered_blocks != header.total_blks as u64 {
            return Err(inconsistent(format!(
                "chunks cover {covered_blocks} blocks, header declares {}",
                header.total_blks
            )));
        }

        // Trailing bytes past the declared chunks are a lie we refuse
        let here = src.stream_position()?;
        let end = src.seek(SeekFrom::End(0))?;
        if here != end {
            return Err(inconsistent(format!("{} trailing bytes", end - here)));
        }

        Ok(Self {
            src,
            header,
            chunks,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn chunks(&self) -> &[ChunkDesc] {
        &self.chunks
    }

    pub fn block_size(&self) -> u32 {
        self.header.blk_sz
    }

    pub fn expanded_size(&self) -> u64 {
        self.header.total_blks as u64 * self.header.blk_sz as u64
    }

    /// Write the expanded image at block offsets into `out`, which stands in
    /// for a tabula-rasa partition. DONT_CARE regions are skipped, not
    /// zeroed; CRC32 chunks carry no blocks.
    pub fn write_expanded<W: Write + Seek>(&mut self, out: &mut W) -> Result<()> {
        let bs = self.header.blk_sz as u64;
        let mut cursor_block: u64 = 0;

        for desc in self.chunks.clone() {
            match desc {
                ChunkDesc::Raw { blocks, data_off } => {
                    self.src.seek(SeekFrom::Start(data_off))?;
                    out.seek(SeekFrom::Start(cursor_block * bs))?;
                    let mut remaining = blocks as u64 * bs;
                    let mut buf = vec![0u8; 1024 * 1024];
                    while remaining > 0 {
                        let n = std::cmp::min(remaining, buf.len() as u64) as usize;
                        self.src.read_exact(&mut buf[..n])?;
                        out.write_all(&buf[..n])?;
                        remaining -= n as u64;
                    }
                }
                ChunkDesc::Fill { blocks, pattern } => {
                    out.seek(SeekFrom::Start(cursor_block * bs))?;
                    let block: Vec<u8> = pattern
                        .iter()
                        .copied()
                        .cycle()
                        .take(self.header.blk_sz as usize)
                        .collect();
                    for _ in 0..blocks {
                        out.write_all(&block)?;
                    }
                }
                ChunkDesc::DontCare { .. } | ChunkDesc::Crc32 { .. } => {}
            }
            cursor_block += desc.blocks() as u64;
        }
        Ok(())
    }
}

/// One protocol-sized piece of a split image.
///
/// `bytes` is a complete, independently parseable sparse file.
/// `declared_size` is the data payload the piece carries (the quantity
/// bounded by `max_packet`); the sparse scaffolding adds a few dozen bytes
/// on top. The piece affects target blocks `first_block..first_block +
/// block_count`.
#[derive(Debug, Clone)]
pub struct SparseChunkData {
    pub index: usize,
    pub total: usize,
    pub bytes: Vec<u8>,
    pub declared_size: u64,
    pub first_block: u64,
    pub block_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PieceOp {
    Raw { src_off: u64, blocks: u32 },
    Fill { pattern: [u8; 4], blocks: u32 },
    DontCare { blocks: u32 },
    Crc32 { value: u32 },
    /// The input fit whole; copy the file through untouched.
    VerbatimFile { len: u64 },
}

#[derive(Debug, Clone)]
struct PiecePlan {
    first_block: u64,
    ops: Vec<PieceOp>,
    payload_bytes: u64,
}

impl PiecePlan {
    fn block_count(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match *op {
                PieceOp::Raw { blocks, .. }
                | PieceOp::Fill { blocks, .. }
                | PieceOp::DontCare { blocks } => blocks as u64,
                _ => 0,
            })
            .sum()
    }
}

/// Splits a raw or sparse input into protocol-legal sparse pieces.
///
/// `max_packet` bounds the data payload of each piece; the number of data
/// blocks per piece is `max_packet / block_size`. The plan is computed up
/// front, so the iterator is finite, its length is known, and `reset()`
/// restarts it from the same source.
pub struct SparseSplitter<R> {
    src: R,
    src_len: u64,
    block_size: u32,
    plan: Vec<PiecePlan>,
    next: usize,
}

impl<R: Read + Seek> SparseSplitter<R> {
    /// Treat the source as a contiguous raw image starting at block 0. The
    /// tail is zero-padded to block alignment.
    pub fn from_raw(mut src: R, block_size: u32, max_packet: u64) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "bad block size {block_size}"
            )));
        }
        let blocks_per_piece = max_packet / block_size as u64;
        if blocks_per_piece == 0 {
            return Err(Error::InvalidArgument(format!(
                "max_packet {max_packet} below one {block_size}-byte block"
            )));
        }

        let src_len = src.seek(SeekFrom::End(0))?;
        let total_blocks = src_len.div_ceil(block_size as u64);

        let mut plan = Vec::new();
        let mut first_block = 0u64;
        while first_block < total_blocks {
            let count = std::cmp::min(blocks_per_piece, total_blocks - first_block);
            plan.push(PiecePlan {
                first_block,
                ops: vec![PieceOp::Raw {
                    src_off: first_block * block_size as u64,
                    blocks: count as u32,
                }],
                payload_bytes: count * block_size as u64,
            });
            first_block += count;
        }

        Ok(Self {
            src,
            src_len,
            block_size,
            plan,
            next: 0,
        })
    }

    /// Re-split an existing sparse image. Chunks are packed greedily; a RAW
    /// chunk that alone exceeds `max_packet` is split on block boundaries.
    pub fn from_sparse(src: R, max_packet: u64) -> Result<Self> {
        let reader = SparseReader::open(src)?;
        let block_size = reader.block_size();
        let blocks_per_piece = max_packet / block_size as u64;
        if blocks_per_piece == 0 {
            return Err(Error::InvalidArgument(format!(
                "max_packet {max_packet} below one {block_size}-byte block"
            )));
        }

        let header = *reader.header();
        let chunks = reader.chunks().to_vec();
        let mut src = reader.src;
        let src_len = src.seek(SeekFrom::End(0))?;

        // Degenerate and fast paths first
        if header.total_blks == 0 {
            return Ok(Self {
                src,
                src_len,
                block_size,
                plan: Vec::new(),
                next: 0,
            });
        }
        if src_len <= max_packet {
            return Ok(Self {
                src,
                src_len,
                block_size,
                plan: vec![PiecePlan {
                    first_block: 0,
                    ops: vec![PieceOp::VerbatimFile { len: src_len }],
                    payload_bytes: src_len,
                }],
                next: 0,
            });
        }

        let budget = blocks_per_piece * block_size as u64;
        let mut plan: Vec<PiecePlan> = Vec::new();
        let mut open: Option<PiecePlan> = None;
        let mut cursor: u64 = 0;

        fn close(plan: &mut Vec<PiecePlan>, open: &mut Option<PiecePlan>) {
            if let Some(p) = open.take() {
                plan.push(p);
            }
        }

        for desc in chunks {
            match desc {
                ChunkDesc::DontCare { blocks } => {
                    // Inside a piece the gap must be spelled out; between
                    // pieces the next lead DONT_CARE absorbs it.
                    if let Some(p) = open.as_mut() {
                        p.ops.push(PieceOp::DontCare { blocks });
                    }
                    cursor += blocks as u64;
                }
                ChunkDesc::Fill { blocks, pattern } => {
                    let p = open.get_or_insert_with(|| PiecePlan {
                        first_block: cursor,
                        ops: Vec::new(),
                        payload_bytes: 0,
                    });
                    if p.payload_bytes + 4 > budget {
                        close(&mut plan, &mut open);
                        open = Some(PiecePlan {
                            first_block: cursor,
                            ops: Vec::new(),
                            payload_bytes: 0,
                        });
                    }
                    let p = open.as_mut().unwrap();
                    p.ops.push(PieceOp::Fill { pattern, blocks });
                    p.payload_bytes += 4;
                    cursor += blocks as u64;
                }
                ChunkDesc::Raw {
                    mut blocks,
                    mut data_off,
                } => {
                    while blocks > 0 {
                        if open.is_none() {
                            open = Some(PiecePlan {
                                first_block: cursor,
                                ops: Vec::new(),
                                payload_bytes: 0,
                            });
                        }
                        let p = open.as_mut().unwrap();
                        let room_blocks = (budget - p.payload_bytes) / block_size as u64;
                        if room_blocks == 0 {
                            close(&mut plan, &mut open);
                            continue;
                        }
                        let take = std::cmp::min(room_blocks, blocks as u64) as u32;
                        p.ops.push(PieceOp::Raw {
                            src_off: data_off,
                            blocks: take,
                        });
                        p.payload_bytes += take as u64 * block_size as u64;
                        cursor += take as u64;
                        data_off += take as u64 * block_size as u64;
                        blocks -= take;
                        if p.payload_bytes >= budget {
                            close(&mut plan, &mut open);
                        }
                    }
                }
                ChunkDesc::Crc32 { value } => {
                    let p = open.get_or_insert_with(|| PiecePlan {
                        first_block: cursor,
                        ops: Vec::new(),
                        payload_bytes: 0,
                    });
                    p.ops.push(PieceOp::Crc32 { value });
                    p.payload_bytes += 4;
                }
            }
        }
        close(&mut plan, &mut open);

        Ok(Self {
            src,
            src_len,
            block_size,
            plan,
            next: 0,
        })
    }

    /// Number of pieces this splitter will emit.
    pub fn piece_count(&self) -> usize {
        self.plan.len()
    }

    /// Exact on-the-wire size of one planned piece.
    pub fn output_len(&self, index: usize) -> u64 {
        let plan = &self.plan[index];
        if let [PieceOp::VerbatimFile { len }] = plan.ops[..] {
            return len;
        }
        let lead = u64::from(plan.first_block > 0);
        FILE_HEADER_LEN as u64
            + (plan.ops.len() as u64 + lead) * CHUNK_HEADER_LEN as u64
            + plan.payload_bytes
    }

    /// Sum of every piece's on-the-wire size, headers included.
    pub fn total_output_len(&self) -> u64 {
        (0..self.plan.len()).map(|i| self.output_len(i)).sum()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Restart emission from the first piece.
    pub fn reset(&mut self) {
        self.next = 0;
    }

    fn emit(&mut self, index: usize) -> Result<SparseChunkData> {
        let plan = self.plan[index].clone();
        let total = self.plan.len();

        if let [PieceOp::VerbatimFile { len }] = plan.ops[..] {
            let mut bytes = vec![0u8; len as usize];
            self.src.seek(SeekFrom::Start(0))?;
            self.src.read_exact(&mut bytes)?;
            let block_count = plan.block_count().max(
                // verbatim pieces cover whatever the input header declared
                bincode::deserialize::<SparseHeader>(&bytes[..FILE_HEADER_LEN])
                    .map(|h| h.total_blks as u64)
                    .unwrap_or(0),
            );
            return Ok(SparseChunkData {
                index,
                total,
                bytes,
                declared_size: len,
                first_block: 0,
                block_count,
            });
        }

        let bs = self.block_size;
        let lead = plan.first_block > 0;
        let chunk_count = plan.ops.len() as u32 + lead as u32;
        let block_count = plan.block_count();

        let header = SparseHeader::for_image(
            bs,
            (plan.first_block + block_count) as u32,
            chunk_count,
        );

        let mut bytes = Vec::with_capacity(
            FILE_HEADER_LEN + chunk_count as usize * CHUNK_HEADER_LEN + plan.payload_bytes as usize,
        );
        bytes.extend_from_slice(&bincode::serialize(&header).expect("fixed-layout header"));

        let mut push_chunk = |bytes: &mut Vec<u8>, chunk_type: u16, blocks: u32, body: u32| {
            let ch = ChunkHeader {
                chunk_type,
                reserved: 0,
                chunk_sz: blocks,
                total_sz: CHUNK_HEADER_LEN as u32 + body,
            };
            bytes.extend_from_slice(&bincode::serialize(&ch).expect("fixed-layout header"));
        };

        if lead {
            push_chunk(
                &mut bytes,
                CHUNK_TYPE_DONT_CARE,
                plan.first_block as u32,
                0,
            );
        }

        for op in &plan.ops {
            match *op {
                PieceOp::Raw { src_off, blocks } => {
                    let data_len = blocks as u64 * bs as u64;
                    push_chunk(&mut bytes, CHUNK_TYPE_RAW, blocks, data_len as u32);

                    // Zero-pad whatever lies past the end of the source; the
                    // raw path relies on this for its unaligned tail.
                    let avail = self.src_len.saturating_sub(src_off);
                    let file_part = std::cmp::min(avail, data_len);
                    let start = bytes.len();
                    bytes.resize(start + data_len as usize, 0);
                    if file_part > 0 {
                        self.src.seek(SeekFrom::Start(src_off))?;
                        self.src
                            .read_exact(&mut bytes[start..start + file_part as usize])?;
                    }
                }
                PieceOp::Fill { pattern, blocks } => {
                    push_chunk(&mut bytes, CHUNK_TYPE_FILL, blocks, 4);
                    bytes.extend_from_slice(&pattern);
                }
                PieceOp::DontCare { blocks } => {
                    push_chunk(&mut bytes, CHUNK_TYPE_DONT_CARE, blocks, 0);
                }
                PieceOp::Crc32 { value } => {
                    push_chunk(&mut bytes, CHUNK_TYPE_CRC32, 0, 4);
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                PieceOp::VerbatimFile { .. } => unreachable!("handled above"),
            }
        }

        Ok(SparseChunkData {
            index,
            total,
            bytes,
            declared_size: plan.payload_bytes,
            first_block: plan.first_block,
            block_count,
        })
    }
}

impl<R: Read + Seek> Iterator for SparseSplitter<R> {
    type Item = Result<SparseChunkData>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.plan.len() {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(self.emit(i))
    }
}

/// Quick magic probe without consuming the source.
pub fn is_sparse_image<R: Read + Seek + ?Sized>(src: &mut R) -> Result<bool> {
    let pos = src.stream_position()?;
    let mut magic = [0u8; 4];
    let got = match src.read_exact(&mut magic) {
        Ok(()) => u32::from_le_bytes(magic) == SPARSE_MAGIC,
        Err(_) => false,
    };
    src.seek(SeekFrom::Start(pos))?;
    Ok(got)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const BS: u32 = 4096;

    fn header_bytes(blk_sz: u32, total_blks: u32, total_chunks: u32) -> Vec<u8> {
        bincode::serialize(&SparseHeader::for_image(blk_sz, total_blks, total_chunks)).unwrap()
    }

    fn chunk_bytes(chunk_type: u16, blocks: u32, body: u32) -> Vec<u8> {
        bincode::serialize(&ChunkHeader {
            chunk_type,
            reserved: 0,
            chunk_sz: blocks,
            total_sz: CHUNK_HEADER_LEN as u32 + body,
        })
        .unwrap()
    }

    /// Hand-rolled sparse file: RAW of `raw_blocks`, a DONT_CARE hole,
    /// a FILL, and a trailing CRC32.
    fn mixed_sparse() -> (Vec<u8>, Vec<u8>) {
        let raw_data: Vec<u8> = (0..2 * BS as usize).map(|i| (i % 251) as u8).collect();
        let mut f = header_bytes(BS, 2 + 3 + 2, 4);
        f.extend(chunk_bytes(CHUNK_TYPE_RAW, 2, 2 * BS));
        f.extend(&raw_data);
        f.extend(chunk_bytes(CHUNK_TYPE_DONT_CARE, 3, 0));
        f.extend(chunk_bytes(CHUNK_TYPE_FILL, 2, 4));
        f.extend([0xDE, 0xAD, 0xBE, 0xEF]);
        f.extend(chunk_bytes(CHUNK_TYPE_CRC32, 0, 4));
        f.extend(0u32.to_le_bytes());

        // Expected expansion on a zeroed target
        let mut img = vec![0u8; 7 * BS as usize];
        img[..2 * BS as usize].copy_from_slice(&raw_data);
        let fill: Vec<u8> = [0xDE, 0xAD, 0xBE, 0xEF]
            .iter()
            .copied()
            .cycle()
            .take(2 * BS as usize)
            .collect();
        img[5 * BS as usize..].copy_from_slice(&fill);
        (f, img)
    }

    fn expand_pieces(pieces: &[SparseChunkData], total_bytes: usize) -> Vec<u8> {
        let mut img = Cursor::new(vec![0u8; total_bytes]);
        for p in pieces {
            let mut r = SparseReader::open(Cursor::new(p.bytes.clone())).unwrap();
            r.write_expanded(&mut img).unwrap();
        }
        img.into_inner()
    }

    #[test]
    fn parses_and_expands_a_mixed_image() {
        let (file, expected) = mixed_sparse();
        let mut r = SparseReader::open(Cursor::new(file)).unwrap();
        assert_eq!(r.header().total_blks, 7);
        assert_eq!(r.chunks().len(), 4);

        let mut out = Cursor::new(vec![0u8; expected.len()]);
        r.write_expanded(&mut out).unwrap();
        assert_eq!(out.into_inner(), expected);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = header_bytes(BS, 0, 0);
        file[0] = 0x42;
        assert!(matches!(
            SparseReader::open(Cursor::new(file)),
            Err(Error::Image(ImageError::BadSparseMagic(_)))
        ));
    }

    #[test]
    fn rejects_block_count_mismatch() {
        let mut file = header_bytes(BS, 10, 1);
        file.extend(chunk_bytes(CHUNK_TYPE_DONT_CARE, 9, 0));
        assert!(matches!(
            SparseReader::open(Cursor::new(file)),
            Err(Error::Image(ImageError::InconsistentChunks(_)))
        ));
    }

    #[test]
    fn raw_split_preserves_absolute_offsets() {
        // 10 MiB of a constant byte, 1 MiB pieces: ten files, each after
        // the first led by a DONT_CARE covering everything before it.
        let raw = vec![0xAB_u8; 10 * 1024 * 1024];
        let mut splitter =
            SparseSplitter::from_raw(Cursor::new(raw.clone()), BS, 1024 * 1024).unwrap();
        assert_eq!(splitter.piece_count(), 10);

        let pieces: Vec<_> = splitter.by_ref().collect::<Result<_>>().unwrap();
        for (i, p) in pieces.iter().enumerate() {
            assert_eq!(p.index, i);
            assert_eq!(p.total, 10);
            assert_eq!(p.first_block, i as u64 * 256);
            assert_eq!(p.block_count, 256);
            assert!(p.declared_size <= 1024 * 1024);

            let r = SparseReader::open(Cursor::new(p.bytes.clone())).unwrap();
            if i == 0 {
                assert_eq!(r.chunks().len(), 1);
                assert!(matches!(r.chunks()[0], ChunkDesc::Raw { blocks: 256, .. }));
            } else {
                assert_eq!(r.chunks().len(), 2);
                assert!(matches!(
                    r.chunks()[0],
                    ChunkDesc::DontCare { blocks } if blocks as usize == i * 256
                ));
            }
        }

        assert_eq!(expand_pieces(&pieces, raw.len()), raw);
    }

    #[test]
    fn raw_split_zero_pads_the_unaligned_tail() {
        let raw = vec![0x5A_u8; BS as usize + 100];
        let splitter = SparseSplitter::from_raw(Cursor::new(raw.clone()), BS, 1024 * 1024).unwrap();
        let pieces: Vec<_> = splitter.collect::<Result<_>>().unwrap();
        assert_eq!(pieces.len(), 1);

        let mut expected = raw;
        expected.resize(2 * BS as usize, 0);
        assert_eq!(expand_pieces(&pieces, expected.len()), expected);
    }

    #[test]
    fn empty_raw_input_yields_no_pieces() {
        let splitter =
            SparseSplitter::from_raw(Cursor::new(Vec::<u8>::new()), BS, 1024 * 1024).unwrap();
        assert_eq!(splitter.piece_count(), 0);
    }

    #[test]
    fn oversized_raw_chunk_splits_on_block_boundaries() {
        // One 8 MiB RAW chunk at block 0, 1 MiB budget: 8 pieces, the i-th
        // prefixed by a DONT_CARE over i * 256 blocks.
        let data: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 127) as u8).collect();
        let blocks = (data.len() / BS as usize) as u32;
        let mut file = header_bytes(BS, blocks, 1);
        file.extend(chunk_bytes(CHUNK_TYPE_RAW, blocks, data.len() as u32));
        file.extend(&data);

        let splitter = SparseSplitter::from_sparse(Cursor::new(file), 1024 * 1024).unwrap();
        assert_eq!(splitter.piece_count(), 8);

        let pieces: Vec<_> = splitter.collect::<Result<_>>().unwrap();
        let mut raw_total = 0u64;
        for (i, p) in pieces.iter().enumerate() {
            assert_eq!(p.first_block, i as u64 * 256);
            assert_eq!(p.block_count, 256);
            let r = SparseReader::open(Cursor::new(p.bytes.clone())).unwrap();
            for c in r.chunks() {
                if let ChunkDesc::Raw { blocks, .. } = c {
                    raw_total += *blocks as u64 * BS as u64;
                }
            }
        }
        assert_eq!(raw_total, data.len() as u64);
        assert_eq!(expand_pieces(&pieces, data.len()), data);
    }

    #[test]
    fn small_sparse_input_passes_through_verbatim() {
        let (file, _) = mixed_sparse();
        let splitter =
            SparseSplitter::from_sparse(Cursor::new(file.clone()), 64 * 1024 * 1024).unwrap();
        let pieces: Vec<_> = splitter.collect::<Result<_>>().unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].bytes, file);
    }

    #[test]
    fn zero_block_image_is_a_noop() {
        let file = header_bytes(BS, 0, 0);
        let splitter = SparseSplitter::from_sparse(Cursor::new(file), 4 * BS as u64).unwrap();
        assert_eq!(splitter.piece_count(), 0);
    }

    #[test]
    fn resplit_conserves_a_mixed_image() {
        let (file, expected) = mixed_sparse();
        // Budget small enough to force multiple pieces (2 blocks each)
        let splitter = SparseSplitter::from_sparse(Cursor::new(file), 2 * BS as u64).unwrap();
        let pieces: Vec<_> = splitter.collect::<Result<_>>().unwrap();
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(p.declared_size <= 2 * BS as u64);
            SparseReader::open(Cursor::new(p.bytes.clone())).unwrap();
        }
        assert_eq!(expand_pieces(&pieces, expected.len()), expected);
    }

    #[test]
    fn splitter_is_restartable() {
        let raw = vec![0x11_u8; 3 * BS as usize];
        let mut splitter = SparseSplitter::from_raw(Cursor::new(raw), BS, BS as u64).unwrap();
        let first: Vec<_> = splitter.by_ref().collect::<Result<_>>().unwrap();
        splitter.reset();
        let second: Vec<_> = splitter.collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.bytes, b.bytes);
        }
    }

    #[test]
    fn probe_recognises_sparse_magic() {
        let (file, _) = mixed_sparse();
        let mut c = Cursor::new(file);
        assert!(is_sparse_image(&mut c).unwrap());
        assert_eq!(c.stream_position().unwrap(), 0);

        let mut plain = Cursor::new(vec![0u8; 64]);
        assert!(!is_sparse_image(&mut plain).unwrap());
    }
}
