//! The executable image format.
//!
//! A flat little-endian container: a magic number, the entry point, and a
//! table of program segment headers followed by the segment data. Only
//! `Load` segments occupy memory; `memsz` may exceed `filesz`, in which
//! case the tail of the segment is zero (BSS).

use alloc::vec::Vec;
use nom::bytes::complete::tag;
use nom::combinator::map;
use nom::error::Error;
use nom::number::complete::le_u32;
use nom::IResult;

pub const IMAGE_MAGIC: [u8; 4] = [0x7F, b'M', b'R', b'X'];

const SEGMENT_HEADER_SIZE: usize = 24;
const IMAGE_HEADER_SIZE: usize = 12;

const SEGMENT_KIND_LOAD: u32 = 1;
const FLAG_EXECUTABLE: u32 = 0x1;
const FLAG_WRITABLE: u32 = 0x2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Other(u32),
}

#[derive(Copy, Clone, Debug)]
pub struct ImageHeader {
    pub entry: u32,
    pub segment_count: u32,
}

impl ImageHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ImageHeader> {
        let (bytes, _) = tag(IMAGE_MAGIC)(bytes)?;
        let (bytes, entry) = le_u32(bytes)?;
        let (bytes, segment_count) = le_u32(bytes)?;
        Ok((
            bytes,
            ImageHeader {
                entry,
                segment_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SegmentHeader {
    pub kind: SegmentKind,
    // Offset of the segment data within the image file.
    pub file_offset: u32,
    pub vaddr: u32,
    // Initialised bytes present in the file.
    pub filesz: u32,
    // Size that needs to be mapped; at least filesz for a wellformed image.
    pub memsz: u32,
    pub executable: bool,
    pub writable: bool,
}

impl SegmentHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], SegmentHeader> {
        let (bytes, kind) = map(le_u32, |value| match value {
            SEGMENT_KIND_LOAD => SegmentKind::Load,
            other => SegmentKind::Other(other),
        })(bytes)?;
        let (bytes, flags) = le_u32(bytes)?;
        let (bytes, file_offset) = le_u32(bytes)?;
        let (bytes, vaddr) = le_u32(bytes)?;
        let (bytes, filesz) = le_u32(bytes)?;
        let (bytes, memsz) = le_u32(bytes)?;
        Ok((
            bytes,
            SegmentHeader {
                kind,
                file_offset,
                vaddr,
                filesz,
                memsz,
                executable: flags & FLAG_EXECUTABLE != 0,
                writable: flags & FLAG_WRITABLE != 0,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Image {
    pub header: ImageHeader,
    pub segments: Vec<SegmentHeader>,
}

impl Image {
    pub fn parse(full_bytes: &[u8]) -> IResult<&[u8], Image> {
        let (mut bytes, header) = ImageHeader::parse(full_bytes)?;
        let mut segments = Vec::with_capacity(header.segment_count as usize);
        for _ in 0..header.segment_count {
            let (rest, segment) = SegmentHeader::parse(bytes)?;
            segments.push(segment);
            bytes = rest;
        }
        Ok((bytes, Image { header, segments }))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Image, nom::Err<Error<&[u8]>>> {
        Ok(Self::parse(bytes)?.1)
    }

    /// Bytes of header material for a `segment_count`-segment image; the
    /// loader reads exactly this much before parsing.
    pub fn header_len(segment_count: u32) -> usize {
        IMAGE_HEADER_SIZE + segment_count as usize * SEGMENT_HEADER_SIZE
    }
}

struct SegmentSpec {
    vaddr: u32,
    memsz: u32,
    flags: u32,
    data: Vec<u8>,
}

/// Builds image files; used by the boot-time program installer and tests.
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<SegmentSpec>,
}

impl ImageBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(
        mut self,
        vaddr: u32,
        memsz: u32,
        executable: bool,
        writable: bool,
        data: &[u8],
    ) -> Self {
        let mut flags = 0;
        if executable {
            flags |= FLAG_EXECUTABLE;
        }
        if writable {
            flags |= FLAG_WRITABLE;
        }
        self.segments.push(SegmentSpec {
            vaddr,
            memsz,
            flags,
            data: data.to_vec(),
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let header_len = Image::header_len(self.segments.len() as u32);
        let mut out = Vec::with_capacity(header_len);
        out.extend_from_slice(&IMAGE_MAGIC);
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        let mut offset = header_len as u32;
        for seg in &self.segments {
            out.extend_from_slice(&SEGMENT_KIND_LOAD.to_le_bytes());
            out.extend_from_slice(&seg.flags.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            offset += seg.data.len() as u32;
        }
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_parse() {
        let bytes = ImageBuilder::new(0x1000)
            .segment(0x1000, 0x2000, true, false, b"text bytes")
            .segment(0x4000, 0x100, false, true, b"data")
            .build();
        let image = Image::parse_bytes(&bytes).unwrap();
        assert_eq!(image.header.entry, 0x1000);
        assert_eq!(image.segments.len(), 2);

        let text = &image.segments[0];
        assert_eq!(text.kind, SegmentKind::Load);
        assert!(text.executable);
        assert!(!text.writable);
        assert_eq!(text.vaddr, 0x1000);
        assert_eq!(text.filesz, 10);
        assert_eq!(text.memsz, 0x2000);
        assert_eq!(
            &bytes[text.file_offset as usize..text.file_offset as usize + 10],
            b"text bytes"
        );

        let data = &image.segments[1];
        assert!(data.writable);
        assert_eq!(
            &bytes[data.file_offset as usize..data.file_offset as usize + 4],
            b"data"
        );
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = ImageBuilder::new(0).segment(0, 16, true, false, &[]).build();
        bytes[0] = 0x00;
        assert!(Image::parse_bytes(&bytes).is_err());
    }

    #[test]
    fn test_header_len_matches_layout() {
        let bytes = ImageBuilder::new(0)
            .segment(0, 8, true, false, b"12345678")
            .build();
        assert_eq!(
            &bytes[Image::header_len(1)..Image::header_len(1) + 8],
            b"12345678"
        );
    }
}
