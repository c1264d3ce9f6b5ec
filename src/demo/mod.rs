//! Demo recording, playback and slicing.
//!
//! A demo is an append-only binary log of a fixed-rate simulation:
//! tick markers interleaved with compressed snapshot, delta and message
//! chunks, preceded by a header and the map the session was played on.
//!
//! # File format
//!
//! ```text
//! Header (176 bytes, fixed offsets):
//!   Magic: "SIMDEMO" (7 bytes)
//!   Version: u8
//!   Net version: 64 bytes, zero padded
//!   Map name: 64 bytes, zero padded
//!   Map size: u32 BE
//!   Map CRC: u32 BE
//!   Kind: 8 bytes ("client"/"server")
//!   Length: u32 BE (chunk stream bytes, patched on stop)
//!   Timestamp: 20 bytes
//!
//! Timeline markers (260 bytes, patched on stop):
//!   Count: u32 BE
//!   Ticks: 64 slots of u32 BE
//!
//! Extension block (version >= 6):
//!   Extension id: 16 bytes
//!   Map SHA-256: 32 bytes
//!
//! Embedded map (map_size bytes)
//!
//! Chunk stream (variable):
//!   Lead byte high bit set: tick marker (keyframe flag 0x40,
//!     compressed 5-bit tick delta, or full u32 BE tick)
//!   Otherwise: payload chunk, type in bits 5-6, size inline or via
//!     one/two escape length bytes; body is varint-packed then LZ4'd
//! ```
//!
//! Three header revisions are still readable: version 3 has no timeline
//! markers or extension block and stores tick deltas in six bits,
//! version 5 introduced the compressed-tick flag, version 6 added the
//! digest extension.

pub mod editor;
pub mod format;
pub mod player;
pub mod recorder;

use std::io;

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::snapshot::DeltaError;

pub use editor::{SliceBounds, slice};
pub use format::{
    CURRENT_VERSION, ChunkHeader, ChunkKind, DIGEST_VERSION, DemoHeader, EXTENSION_ID,
    HEADER_MARKER, MAX_TIMELINE_MARKERS, OLDEST_VERSION, TimelineMarkers,
};
pub use player::{Clock, DemoInfo, DemoPlayer, MapInfo, PlaybackInfo, SystemClock, demo_info};
pub use recorder::{DemoRecorder, MapSource, MessageFilter, RecordMeta};

/// Simulation rate the playback clock is synchronized against.
pub const TICKS_PER_SECOND: i32 = 50;

/// Which side recorded a demo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemoKind {
    /// Recorded by a client from its own view.
    Client,
    /// Recorded by a server with full visibility.
    Server,
    /// Unrecognized type tag.
    Invalid,
}

impl DemoKind {
    /// On-disk type tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Invalid => "invalid",
        }
    }

    /// Parse an on-disk type tag; unknown tags map to [`DemoKind::Invalid`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "client" => Self::Client,
            "server" => Self::Server,
            _ => Self::Invalid,
        }
    }
}

/// Receives reconstructed snapshots and messages during playback.
///
/// Both callbacks run synchronously from within the player's tick loop.
/// A tick may deliver the same snapshot more than once (the player
/// redelivers the last known snapshot for ticks without one); consumers
/// must tolerate duplicates. Payloads come back zero-padded to 4-byte
/// alignment, an artifact of the varint stage.
pub trait DemoListener {
    /// A full snapshot for `tick`, after any delta reconstruction.
    fn on_snapshot(&mut self, tick: i32, data: &[u8]);
    /// A message recorded at `tick`, in file order.
    fn on_message(&mut self, tick: i32, data: &[u8]);
}

/// Errors from recording, playback and slicing.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// File could not be opened, read or written.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The file does not start with the demo magic marker.
    #[error("not a demo file (bad magic marker)")]
    BadMagic,
    /// The format version predates the oldest supported revision.
    #[error("demo version {found} is not supported (oldest supported is {OLDEST_VERSION})")]
    UnsupportedVersion {
        /// Version byte found in the header.
        found: u8,
    },
    /// A chunk could not be decoded.
    #[error("corrupt chunk at byte {offset}: {detail}")]
    Corrupt {
        /// File offset of the offending chunk.
        offset: u64,
        /// What was wrong with it.
        detail: String,
    },
    /// A chunk declared a payload larger than any snapshot may be.
    #[error("chunk of {size} bytes at byte {offset} exceeds the {max} byte snapshot limit")]
    ChunkTooLarge {
        /// Declared payload size.
        size: usize,
        /// The snapshot size limit.
        max: usize,
        /// File offset of the chunk header.
        offset: u64,
    },
    /// Varint or LZ4 stage failed during playback.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The snapshot differencer rejected a delta.
    #[error(transparent)]
    Delta(#[from] DeltaError),
    /// No map data or map source could be resolved at record start.
    #[error("map '{name}' could not be found")]
    MapNotFound {
        /// Name of the map that was looked for.
        name: String,
    },
    /// The demo embeds no map, so there is nothing to extract.
    #[error("demo embeds no map data")]
    NoMapData,
    /// `start` was called while a recording is in progress.
    #[error("already recording")]
    AlreadyRecording,
    /// A recorder operation was called without an active recording.
    #[error("not recording")]
    NotRecording,
    /// A player operation was called without a loaded demo.
    #[error("no demo loaded")]
    NotLoaded,
}
