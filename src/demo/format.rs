//! On-disk format definitions for demo files.

use std::io::{self, Read, Write};

use serde::Serialize;

use super::{DemoError, DemoKind};
use crate::snapshot::MAX_SNAPSHOT_SIZE;

/// Magic bytes identifying a demo file.
pub const HEADER_MARKER: [u8; 7] = *b"SIMDEMO";

/// Format version written by the recorder.
pub const CURRENT_VERSION: u8 = 6;

/// Oldest format version the player still reads.
pub const OLDEST_VERSION: u8 = 3;

/// First version carrying the map digest extension block.
pub const DIGEST_VERSION: u8 = 6;

/// First version using the compressed-tick flag for delta tick markers.
pub const TICK_COMPRESSION_VERSION: u8 = 5;

/// Identifies the map digest extension block. Readers that find a
/// different id here must rewind past it; the block belongs to some
/// unknown extension.
pub const EXTENSION_ID: [u8; 16] = [
    0x4f, 0xd2, 0x1c, 0x8e, 0xa3, 0x07, 0x4b, 0x91, 0xb6, 0x5e, 0x12, 0xda, 0x33, 0xc0, 0x76, 0x2a,
];

/// Most timeline markers a demo can carry.
pub const MAX_TIMELINE_MARKERS: usize = 64;

/// Fixed offset of the header length field, for trailer patching.
pub const LENGTH_OFFSET: u64 = 152;

/// Fixed offset of the timeline-marker block, for trailer patching.
pub const MARKERS_OFFSET: u64 = 176;

const NET_VERSION_LEN: usize = 64;
const MAP_NAME_LEN: usize = 64;
const KIND_LEN: usize = 8;
const TIMESTAMP_LEN: usize = 20;

// Chunk lead byte layout.
const FLAG_TICK_MARKER: u8 = 0x80;
const FLAG_KEYFRAME: u8 = 0x40;
const FLAG_TICK_COMPRESSED: u8 = 0x20;
const MASK_TICK: u8 = 0x1f;
const MASK_TICK_LEGACY: u8 = 0x3f;
const MASK_TYPE: u8 = 0x60;
const MASK_SIZE: u8 = 0x1f;
const SIZE_ESCAPE_U8: u8 = 30;
const SIZE_ESCAPE_U16: u8 = 31;

/// Fixed-size demo file header.
///
/// Strings are stored zero padded; scalar fields are big-endian. The
/// `length` field is zero until the recorder patches it on stop.
#[derive(Debug, Clone, Serialize)]
pub struct DemoHeader {
    /// Format version of this file.
    pub version: u8,
    /// Network protocol version the session used.
    pub net_version: String,
    /// Name of the map the session was played on.
    pub map_name: String,
    /// Byte length of the embedded map (0 when embedding was skipped).
    pub map_size: u32,
    /// CRC of the map.
    pub map_crc: u32,
    /// Which side recorded the demo.
    pub kind: DemoKind,
    /// Byte length of the chunk stream, patched on stop.
    pub length: u32,
    /// Human-readable recording time.
    pub timestamp: String,
}

impl DemoHeader {
    /// Size of the header record in bytes.
    pub const SIZE: usize = 176;

    /// Write the header at the current position.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; Self::SIZE];
        buf[..7].copy_from_slice(&HEADER_MARKER);
        buf[7] = self.version;
        put_str(&mut buf[8..8 + NET_VERSION_LEN], &self.net_version);
        put_str(&mut buf[72..72 + MAP_NAME_LEN], &self.map_name);
        buf[136..140].copy_from_slice(&self.map_size.to_be_bytes());
        buf[140..144].copy_from_slice(&self.map_crc.to_be_bytes());
        put_str(&mut buf[144..144 + KIND_LEN], self.kind.as_str());
        buf[152..156].copy_from_slice(&self.length.to_be_bytes());
        put_str(&mut buf[156..156 + TIMESTAMP_LEN], &self.timestamp);
        w.write_all(&buf)
    }

    /// Read and validate a header.
    ///
    /// The magic marker and version are checked before any other field
    /// is parsed; a version below [`OLDEST_VERSION`] fails without
    /// reading further.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, DemoError> {
        let mut buf = [0u8; Self::SIZE];
        r.read_exact(&mut buf)?;
        if buf[..7] != HEADER_MARKER {
            return Err(DemoError::BadMagic);
        }
        let version = buf[7];
        if version < OLDEST_VERSION {
            return Err(DemoError::UnsupportedVersion { found: version });
        }
        Ok(Self {
            version,
            net_version: get_str(&buf[8..8 + NET_VERSION_LEN]),
            map_name: get_str(&buf[72..72 + MAP_NAME_LEN]),
            map_size: u32::from_be_bytes(buf[136..140].try_into().unwrap()),
            map_crc: u32::from_be_bytes(buf[140..144].try_into().unwrap()),
            kind: DemoKind::from_tag(&get_str(&buf[144..144 + KIND_LEN])),
            length: u32::from_be_bytes(buf[152..156].try_into().unwrap()),
            timestamp: get_str(&buf[156..156 + TIMESTAMP_LEN]),
        })
    }
}

/// Ticks the user flagged as interesting during recording.
///
/// Stored as a fixed-capacity block right after the header so the
/// recorder can patch it on stop. Absent entirely in version 3 files.
#[derive(Debug, Clone, Default)]
pub struct TimelineMarkers {
    /// Marker ticks, at most [`MAX_TIMELINE_MARKERS`].
    pub ticks: Vec<i32>,
}

impl TimelineMarkers {
    /// Size of the marker block in bytes.
    pub const SIZE: usize = 4 + MAX_TIMELINE_MARKERS * 4;

    /// Write the block (count, ticks, zero padding).
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = [0u8; Self::SIZE];
        let count = self.ticks.len().min(MAX_TIMELINE_MARKERS);
        buf[..4].copy_from_slice(&(count as u32).to_be_bytes());
        for (i, tick) in self.ticks.iter().take(count).enumerate() {
            let at = 4 + i * 4;
            buf[at..at + 4].copy_from_slice(&tick.to_be_bytes());
        }
        w.write_all(&buf)
    }

    /// Read the block; a count beyond capacity is clamped.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        r.read_exact(&mut buf)?;
        let count = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        let count = count.min(MAX_TIMELINE_MARKERS);
        let mut ticks = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * 4;
            ticks.push(i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()));
        }
        Ok(Self { ticks })
    }
}

/// Payload chunk type, stored in bits 5-6 of the lead byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    /// Full state snapshot (written at keyframes).
    Snapshot = 1,
    /// Game message.
    Message = 2,
    /// Binary delta against the previous snapshot.
    Delta = 3,
}

impl ChunkKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Snapshot),
            2 => Some(Self::Message),
            3 => Some(Self::Delta),
            _ => None,
        }
    }
}

/// One decoded chunk header from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// A tick marker; the payload chunks that follow belong to `tick`.
    Tick {
        /// Absolute tick number (delta encodings already resolved).
        tick: i32,
        /// Whether a full snapshot follows (seek target).
        keyframe: bool,
    },
    /// A typed, size-prefixed payload chunk.
    Payload {
        /// What the body contains.
        kind: ChunkKind,
        /// Compressed body size in bytes.
        size: usize,
    },
}

impl ChunkHeader {
    /// Decode the next chunk header.
    ///
    /// `last_tick` is the running tick value that delta-encoded markers
    /// add onto; `offset` is the header's file offset, used for error
    /// context. Returns `Ok(None)` at a clean end of stream.
    ///
    /// Three tick-marker encodings coexist: files older than the
    /// compressed-tick revision store any nonzero delta directly in the
    /// low six bits; newer files store a five-bit delta only when the
    /// compressed flag is set; everything else carries the full 32-bit
    /// tick. Decoders must branch on the header version or they corrupt
    /// tick numbers on old files.
    pub fn read<R: Read>(
        r: &mut R,
        version: u8,
        last_tick: i32,
        offset: u64,
    ) -> Result<Option<Self>, DemoError> {
        let mut lead = [0u8; 1];
        match r.read_exact(&mut lead) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let lead = lead[0];

        if lead & FLAG_TICK_MARKER != 0 {
            let keyframe = lead & FLAG_KEYFRAME != 0;
            let legacy_delta = lead & MASK_TICK_LEGACY;
            let tick = if version < TICK_COMPRESSION_VERSION && legacy_delta != 0 {
                last_tick + legacy_delta as i32
            } else if lead & FLAG_TICK_COMPRESSED != 0 {
                last_tick + (lead & MASK_TICK) as i32
            } else {
                let mut tick = [0u8; 4];
                read_exact_chunk(r, &mut tick, offset)?;
                i32::from_be_bytes(tick)
            };
            return Ok(Some(Self::Tick { tick, keyframe }));
        }

        let kind_bits = (lead & MASK_TYPE) >> 5;
        let kind = ChunkKind::from_bits(kind_bits).ok_or_else(|| DemoError::Corrupt {
            offset,
            detail: format!("unknown payload chunk type {kind_bits}"),
        })?;
        let size = match lead & MASK_SIZE {
            SIZE_ESCAPE_U8 => {
                let mut b = [0u8; 1];
                read_exact_chunk(r, &mut b, offset)?;
                b[0] as usize
            }
            SIZE_ESCAPE_U16 => {
                let mut b = [0u8; 2];
                read_exact_chunk(r, &mut b, offset)?;
                u16::from_le_bytes(b) as usize
            }
            inline => inline as usize,
        };
        if size > MAX_SNAPSHOT_SIZE {
            return Err(DemoError::ChunkTooLarge {
                size,
                max: MAX_SNAPSHOT_SIZE,
                offset,
            });
        }
        Ok(Some(Self::Payload { kind, size }))
    }
}

/// Encode a tick marker at the current format version.
///
/// A one-byte delta marker is used when the gap since `last_marker`
/// fits in five bits and this is not a keyframe; otherwise the full
/// 32-bit tick is written. Pure space optimization, decoders accept
/// both.
pub fn write_tick_marker<W: Write>(
    w: &mut W,
    tick: i32,
    keyframe: bool,
    last_marker: i32,
) -> io::Result<()> {
    if last_marker == -1 || tick - last_marker > MASK_TICK as i32 || keyframe {
        let mut buf = [0u8; 5];
        buf[0] = FLAG_TICK_MARKER;
        if keyframe {
            buf[0] |= FLAG_KEYFRAME;
        }
        buf[1..5].copy_from_slice(&tick.to_be_bytes());
        w.write_all(&buf)
    } else {
        let delta = (tick - last_marker) as u8;
        w.write_all(&[FLAG_TICK_MARKER | FLAG_TICK_COMPRESSED | delta])
    }
}

/// Encode a payload chunk header. `size` must fit in 16 bits.
pub fn write_payload_header<W: Write>(w: &mut W, kind: ChunkKind, size: usize) -> io::Result<()> {
    debug_assert!(size <= u16::MAX as usize);
    let lead = (kind as u8) << 5;
    if size < SIZE_ESCAPE_U8 as usize {
        w.write_all(&[lead | size as u8])
    } else if size < 256 {
        w.write_all(&[lead | SIZE_ESCAPE_U8, size as u8])
    } else {
        let [lo, hi] = (size as u16).to_le_bytes();
        w.write_all(&[lead | SIZE_ESCAPE_U16, lo, hi])
    }
}

fn read_exact_chunk<R: Read>(r: &mut R, buf: &mut [u8], offset: u64) -> Result<(), DemoError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DemoError::Corrupt {
                offset,
                detail: "truncated chunk header".into(),
            }
        } else {
            e.into()
        }
    })
}

fn put_str(buf: &mut [u8], s: &str) {
    // leave at least one trailing NUL
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_header() -> DemoHeader {
        DemoHeader {
            version: CURRENT_VERSION,
            net_version: "0.7.5".into(),
            map_name: "arena".into(),
            map_size: 9001,
            map_crc: 0xdeadbeef,
            kind: DemoKind::Client,
            length: 0,
            timestamp: "2026-08-27 12:00:00".into(),
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = test_header();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), DemoHeader::SIZE);

        let decoded = DemoHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.version, CURRENT_VERSION);
        assert_eq!(decoded.net_version, "0.7.5");
        assert_eq!(decoded.map_name, "arena");
        assert_eq!(decoded.map_size, 9001);
        assert_eq!(decoded.map_crc, 0xdeadbeef);
        assert_eq!(decoded.kind, DemoKind::Client);
        assert_eq!(decoded.timestamp, "2026-08-27 12:00:00");
    }

    #[test]
    fn length_field_sits_at_fixed_offset() {
        let mut header = test_header();
        header.length = 0x01020304;
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(&buf[LENGTH_OFFSET as usize..LENGTH_OFFSET as usize + 4], &[1, 2, 3, 4]);
        assert_eq!(MARKERS_OFFSET as usize, DemoHeader::SIZE);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        test_header().write_to(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            DemoHeader::read_from(&mut Cursor::new(&buf)),
            Err(DemoError::BadMagic)
        ));
    }

    #[test]
    fn version_below_oldest_rejected() {
        let mut buf = Vec::new();
        test_header().write_to(&mut buf).unwrap();
        buf[7] = OLDEST_VERSION - 1;
        assert!(matches!(
            DemoHeader::read_from(&mut Cursor::new(&buf)),
            Err(DemoError::UnsupportedVersion { found: 2 })
        ));
    }

    #[test]
    fn timeline_markers_roundtrip() {
        let markers = TimelineMarkers {
            ticks: vec![100, 2500, 60_000],
        };
        let mut buf = Vec::new();
        markers.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), TimelineMarkers::SIZE);

        let decoded = TimelineMarkers::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.ticks, vec![100, 2500, 60_000]);
    }

    #[test]
    fn tick_marker_full_and_compressed() {
        let mut buf = Vec::new();
        write_tick_marker(&mut buf, 1000, true, -1).unwrap();
        write_tick_marker(&mut buf, 1002, false, 1000).unwrap();
        write_tick_marker(&mut buf, 1100, false, 1002).unwrap();

        let mut cursor = Cursor::new(&buf);
        let h = ChunkHeader::read(&mut cursor, CURRENT_VERSION, 0, 0).unwrap().unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 1000, keyframe: true });
        let h = ChunkHeader::read(&mut cursor, CURRENT_VERSION, 1000, 0).unwrap().unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 1002, keyframe: false });
        // gap of 98 does not fit in five bits, so a full marker was written
        let h = ChunkHeader::read(&mut cursor, CURRENT_VERSION, 1002, 0).unwrap().unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 1100, keyframe: false });
        assert!(ChunkHeader::read(&mut cursor, CURRENT_VERSION, 1100, 0).unwrap().is_none());
    }

    #[test]
    fn legacy_six_bit_tick_delta() {
        // version 3 stores any nonzero low-bits value as the tick delta,
        // including what newer versions read as the compressed flag
        let lead = [0x80u8 | 0x25];
        let h = ChunkHeader::read(&mut Cursor::new(&lead), 3, 500, 0).unwrap().unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 500 + 0x25, keyframe: false });

        // the same byte on a current-version file is a five-bit delta
        let h = ChunkHeader::read(&mut Cursor::new(&lead), CURRENT_VERSION, 500, 0)
            .unwrap()
            .unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 500 + 0x05, keyframe: false });
    }

    #[test]
    fn legacy_zero_delta_reads_full_tick() {
        let mut buf = vec![0x80u8];
        buf.extend_from_slice(&1234i32.to_be_bytes());
        let h = ChunkHeader::read(&mut Cursor::new(&buf), 3, 500, 0).unwrap().unwrap();
        assert_eq!(h, ChunkHeader::Tick { tick: 1234, keyframe: false });
    }

    #[test]
    fn payload_size_encodings() {
        let mut buf = Vec::new();
        write_payload_header(&mut buf, ChunkKind::Snapshot, 7).unwrap();
        write_payload_header(&mut buf, ChunkKind::Message, 200).unwrap();
        write_payload_header(&mut buf, ChunkKind::Delta, 40_000).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 3);

        let mut cursor = Cursor::new(&buf);
        for expect in [
            ChunkHeader::Payload { kind: ChunkKind::Snapshot, size: 7 },
            ChunkHeader::Payload { kind: ChunkKind::Message, size: 200 },
            ChunkHeader::Payload { kind: ChunkKind::Delta, size: 40_000 },
        ] {
            let h = ChunkHeader::read(&mut cursor, CURRENT_VERSION, 0, 0).unwrap().unwrap();
            assert_eq!(h, expect);
        }
    }

    #[test]
    fn boundary_sizes_roundtrip() {
        for size in [0usize, 29, 30, 31, 255, 256, u16::MAX as usize] {
            let mut buf = Vec::new();
            write_payload_header(&mut buf, ChunkKind::Message, size).unwrap();
            let h = ChunkHeader::read(&mut Cursor::new(&buf), CURRENT_VERSION, 0, 0)
                .unwrap()
                .unwrap();
            assert_eq!(h, ChunkHeader::Payload { kind: ChunkKind::Message, size });
        }
    }

    #[test]
    fn unknown_payload_type_is_corrupt() {
        let buf = [0x05u8];
        assert!(matches!(
            ChunkHeader::read(&mut Cursor::new(&buf), CURRENT_VERSION, 0, 42),
            Err(DemoError::Corrupt { offset: 42, .. })
        ));
    }

    #[test]
    fn truncated_full_tick_is_corrupt() {
        let buf = [0x80u8, 0x00, 0x01];
        assert!(matches!(
            ChunkHeader::read(&mut Cursor::new(&buf), CURRENT_VERSION, 0, 7),
            Err(DemoError::Corrupt { offset: 7, .. })
        ));
    }
}
