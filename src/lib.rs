//! Demorec - versioned binary replay logs for tick-based simulations.
//!
//! This crate records a simulation session (snapshots, deltas and game
//! messages at a fixed tick rate) into a compact append-only demo file,
//! plays it back with seeking and variable speed, and slices existing
//! demos into new standalone ones.
//!
//! # Architecture
//!
//! The crate is split into four modules:
//!
//! - `codec`: the two-stage chunk body compression (varint + LZ4)
//! - `snapshot`: the pluggable snapshot differencer
//! - `storage`: root-anchored file access and the map cache
//! - `demo`: file format, recorder, player and editor
//!
//! # Example
//!
//! ```rust,no_run
//! use demorec::{
//!     demo::{DemoKind, DemoListener, DemoPlayer, DemoRecorder, MapSource, RecordMeta},
//!     snapshot::VerbatimDelta,
//!     storage::Storage,
//! };
//!
//! let storage = Storage::new("/var/lib/game");
//! let delta = VerbatimDelta;
//!
//! // Record a short session
//! let mut recorder = DemoRecorder::new(&delta);
//! let meta = RecordMeta {
//!     net_version: "0.7.5",
//!     map_name: "arena",
//!     map_sha256: None,
//!     map_crc: 0x1234_5678,
//!     kind: DemoKind::Server,
//! };
//! recorder
//!     .start(&storage, "demos/run.demo", &meta, MapSource::Resolve, None)
//!     .unwrap();
//! for tick in 0..500 {
//!     recorder.record_snapshot(tick, &[0u8; 64]).unwrap();
//! }
//! recorder.stop().unwrap();
//!
//! // Play it back
//! struct Print;
//! impl DemoListener for Print {
//!     fn on_snapshot(&mut self, tick: i32, data: &[u8]) {
//!         println!("tick {tick}: {} snapshot bytes", data.len());
//!     }
//!     fn on_message(&mut self, _tick: i32, _data: &[u8]) {}
//! }
//!
//! let mut player = DemoPlayer::new(&delta);
//! player.load(&storage, "demos/run.demo").unwrap();
//! let mut listener = Print;
//! player.play(&mut listener);
//! while player.is_playing() && !player.info().paused {
//!     player.update(&mut listener, true);
//! }
//! ```

pub mod codec;
pub mod demo;
pub mod snapshot;
pub mod storage;

// Re-export commonly used types
pub use demo::{
    DemoError, DemoInfo, DemoKind, DemoListener, DemoPlayer, DemoRecorder, PlaybackInfo,
    SliceBounds, demo_info, slice,
};
pub use snapshot::{SnapshotDelta, VerbatimDelta};
pub use storage::Storage;
