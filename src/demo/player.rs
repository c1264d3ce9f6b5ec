//! Demo player: loading, seeking and real-time playback.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::format::{
    ChunkHeader, ChunkKind, DIGEST_VERSION, DemoHeader, EXTENSION_ID, OLDEST_VERSION,
    TimelineMarkers,
};
use super::{DemoError, DemoListener, TICKS_PER_SECOND};
use crate::codec;
use crate::snapshot::{MAX_SNAPSHOT_SIZE, SnapshotDelta};
use crate::storage::Storage;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Ticks subtracted from a seek target so a previous and current tick
/// are always available after the fast-forward.
const SEEK_MARGIN_TICKS: i32 = 5;

/// Playback speed presets stepped through by [`DemoPlayer::nudge_speed`].
pub const SPEEDS: [f32; 12] = [
    0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0,
];
const DEFAULT_SPEED_INDEX: usize = 4; // 1.0

/// Source of playback time, injected so tests can drive the player
/// with a manual clock and multiple players can coexist.
pub trait Clock {
    /// Monotonic nanoseconds since an arbitrary epoch.
    fn now(&self) -> i64;
}

/// Wall clock backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Read-only view of the playback state.
///
/// Tick fields are `-1` while unknown (nothing decoded yet). Reset on
/// load, mutated by every simulated step.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackInfo {
    /// First tick of the whole log.
    pub first_tick: i32,
    /// Last tick of the whole log.
    pub last_tick: i32,
    /// Tick whose chunks were decoded most recently.
    pub current_tick: i32,
    /// Tick before the current one.
    pub previous_tick: i32,
    /// Tick of the next marker in the stream.
    pub next_tick: i32,
    /// Fraction (0-1) between previous and current tick, from wall-clock progress.
    pub intra_tick: f32,
    /// Whether playback is paused.
    pub paused: bool,
    /// Speed multiplier, within [0, 256].
    pub speed: f32,
    /// Wall-clock-equivalent playback time in nanoseconds.
    pub current_time_ns: i64,
    /// Ticks the recording user flagged as interesting.
    pub timeline_markers: Vec<i32>,
}

impl PlaybackInfo {
    fn reset(first_tick: i32, last_tick: i32, timeline_markers: Vec<i32>) -> Self {
        Self {
            first_tick,
            last_tick,
            current_tick: -1,
            previous_tick: -1,
            next_tick: -1,
            intra_tick: 0.0,
            paused: false,
            speed: 1.0,
            current_time_ns: 0,
            timeline_markers,
        }
    }
}

/// Metadata about the map a demo was recorded on.
#[derive(Debug, Clone, Serialize)]
pub struct MapInfo {
    /// Map name from the header.
    pub name: String,
    /// Byte size of the embedded map data.
    pub size: u32,
    /// CRC from the header.
    pub crc: u32,
    /// SHA-256 from the digest extension, when present.
    pub sha256: Option<[u8; 32]>,
}

/// Header-level metadata, readable without scanning the chunk stream.
#[derive(Debug, Clone, Serialize)]
pub struct DemoInfo {
    /// The parsed file header.
    pub header: DemoHeader,
    /// Timeline markers (empty for version 3 files).
    pub timeline_markers: Vec<i32>,
    /// Embedded map metadata.
    pub map: MapInfo,
}

/// A seekable position: keyframe tick and the file offset of its marker.
#[derive(Debug, Clone, Copy)]
struct Keyframe {
    tick: i32,
    offset: u64,
}

struct Loaded {
    file: BufReader<File>,
    header: DemoHeader,
    map: MapInfo,
    map_offset: u64,
    chunks_start: u64,
    keyframes: Vec<Keyframe>,
    path: String,
}

enum ReadStep {
    Eof,
    Failed(DemoError),
    Chunk(ChunkHeader, u64),
}

/// Plays back a demo file with seek, pause and speed control.
///
/// State machine: Idle → Loaded{Playing | Paused} → Idle. The file
/// handle and keyframe index are owned for the lifetime of the load and
/// released on [`DemoPlayer::stop`]. Snapshots and messages are
/// delivered synchronously to the [`DemoListener`] passed into the
/// driving calls.
pub struct DemoPlayer<'a> {
    delta: &'a dyn SnapshotDelta,
    clock: Box<dyn Clock>,
    loaded: Option<Loaded>,
    info: PlaybackInfo,
    /// Last delivered snapshot, the reference deltas are applied against.
    last_snapshot: Option<Vec<u8>>,
    last_update: i64,
    speed_index: usize,
}

impl<'a> DemoPlayer<'a> {
    /// Create an idle player using the system clock.
    pub fn new(delta: &'a dyn SnapshotDelta) -> Self {
        Self::with_clock(delta, Box::new(SystemClock::default()))
    }

    /// Create an idle player with an injected clock.
    pub fn with_clock(delta: &'a dyn SnapshotDelta, clock: Box<dyn Clock>) -> Self {
        Self {
            delta,
            clock,
            loaded: None,
            info: PlaybackInfo::reset(-1, -1, Vec::new()),
            last_snapshot: None,
            last_update: 0,
            speed_index: DEFAULT_SPEED_INDEX,
        }
    }

    /// Whether a demo is loaded (paused playback counts as playing).
    pub fn is_playing(&self) -> bool {
        self.loaded.is_some()
    }

    /// Current playback state.
    pub fn info(&self) -> &PlaybackInfo {
        &self.info
    }

    /// Header of the loaded demo.
    pub fn header(&self) -> Option<&DemoHeader> {
        self.loaded.as_ref().map(|l| &l.header)
    }

    /// Map metadata of the loaded demo.
    pub fn map_info(&self) -> Option<&MapInfo> {
        self.loaded.as_ref().map(|l| &l.map)
    }

    /// File name of the loaded demo, without folders or extension.
    pub fn demo_name(&self) -> Option<String> {
        self.loaded.as_ref().map(|l| {
            Path::new(&l.path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| l.path.clone())
        })
    }

    /// Load a demo from the root-relative `path` and prepare playback.
    ///
    /// Validates the magic marker and version before anything else,
    /// reads timeline markers and the digest extension as the version
    /// dictates, notes where the embedded map sits without reading it,
    /// then scans the whole chunk stream once to build the keyframe
    /// index and rewinds to the first chunk. Playback state is reset
    /// (ticks to -1, speed to 1).
    pub fn load(&mut self, storage: &Storage, path: &str) -> Result<(), DemoError> {
        if self.loaded.is_some() {
            self.stop_internal();
        }

        let mut file = BufReader::new(storage.open_read(path)?);
        let header = DemoHeader::read_from(&mut file).inspect_err(|e| {
            warn!(target: "demo_player", "'{path}': {e}");
        })?;

        let mut timeline = TimelineMarkers::default();
        if header.version > OLDEST_VERSION {
            timeline = TimelineMarkers::read_from(&mut file)?;
        }

        let mut sha256 = None;
        if header.version >= DIGEST_VERSION {
            let mut id = [0u8; 16];
            file.read_exact(&mut id)?;
            if id == EXTENSION_ID {
                let mut digest = [0u8; 32];
                file.read_exact(&mut digest)?;
                sha256 = Some(digest);
            } else {
                // some other extension we do not know; leave its bytes alone
                debug!(target: "demo_player", "'{path}': unknown extension block, rewinding");
                file.seek_relative(-16)?;
            }
        }

        let map_offset = file.stream_position()?;
        file.seek_relative(header.map_size as i64)?;
        let chunks_start = file.stream_position()?;

        let (keyframes, first_tick, last_tick) = scan_file(&mut file, header.version)?;

        info!(
            target: "demo_player",
            "loaded '{path}': ticks {first_tick}..{last_tick}, {} seekable keyframes",
            keyframes.len()
        );

        self.info = PlaybackInfo::reset(first_tick, last_tick, timeline.ticks);
        self.speed_index = DEFAULT_SPEED_INDEX;
        self.last_snapshot = None;
        self.last_update = self.clock.now();
        self.loaded = Some(Loaded {
            file,
            map: MapInfo {
                name: header.map_name.clone(),
                size: header.map_size,
                crc: header.map_crc,
                sha256,
            },
            header,
            map_offset,
            chunks_start,
            keyframes,
            path: path.to_owned(),
        });
        Ok(())
    }

    /// Decode one tick's worth of chunks, delivering to `listener`.
    ///
    /// Advances previous ← current ← next tick, then reads chunks until
    /// the next tick marker (or end of stream). Deltas are reconstructed
    /// against the last snapshot; a tick without any snapshot redelivers
    /// the previous one unchanged. Read or decode errors stop playback;
    /// end of stream pauses, unless no tick was ever decoded (an empty
    /// demo is terminal).
    pub fn do_tick(&mut self, listener: &mut dyn DemoListener) {
        if self.loaded.is_none() {
            return;
        }

        self.info.previous_tick = self.info.current_tick;
        self.info.current_tick = self.info.next_tick;
        self.update_intra();

        let chunk_tick = self.info.current_tick;
        let mut got_snapshot = false;

        loop {
            let step = {
                let Some(loaded) = self.loaded.as_mut() else {
                    return;
                };
                match loaded.file.stream_position() {
                    Err(e) => ReadStep::Failed(e.into()),
                    Ok(offset) => {
                        match ChunkHeader::read(&mut loaded.file, loaded.header.version, chunk_tick, offset)
                        {
                            Ok(None) => ReadStep::Eof,
                            Ok(Some(header)) => ReadStep::Chunk(header, offset),
                            Err(e) => ReadStep::Failed(e),
                        }
                    }
                }
            };

            match step {
                ReadStep::Eof => {
                    if self.info.previous_tick == -1 {
                        info!(target: "demo_player", "empty demo");
                        self.stop_internal();
                    } else {
                        self.pause();
                    }
                    return;
                }
                ReadStep::Failed(e) => {
                    warn!(target: "demo_player", "stopping playback: {e}");
                    self.stop_internal();
                    return;
                }
                ReadStep::Chunk(ChunkHeader::Tick { tick, .. }, offset) => {
                    // a tick with no snapshot replays the last known one
                    if !got_snapshot && let Some(last) = self.last_snapshot.as_ref() {
                        listener.on_snapshot(self.info.current_tick, last);
                    }
                    if self.info.current_tick != -1 && tick < self.info.current_tick {
                        warn!(
                            target: "demo_player",
                            "non-monotonic tick {tick} after {} at byte {offset}, stopping",
                            self.info.current_tick
                        );
                        self.stop_internal();
                        return;
                    }
                    self.info.next_tick = tick;
                    return;
                }
                ReadStep::Chunk(ChunkHeader::Payload { kind, size }, offset) => {
                    let body = {
                        let Some(loaded) = self.loaded.as_mut() else {
                            return;
                        };
                        let mut compressed = vec![0u8; size];
                        loaded
                            .file
                            .read_exact(&mut compressed)
                            .map_err(DemoError::from)
                            .and_then(|()| {
                                Ok(codec::decompress(&compressed, MAX_SNAPSHOT_SIZE)?)
                            })
                            .and_then(|d| Ok(codec::unpack_ints(&d, MAX_SNAPSHOT_SIZE)?))
                    };
                    let body = match body {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(
                                target: "demo_player",
                                "bad chunk at byte {offset}, stopping playback: {e}"
                            );
                            self.stop_internal();
                            return;
                        }
                    };

                    match kind {
                        ChunkKind::Delta => {
                            got_snapshot = true;
                            let Some(reference) = self.last_snapshot.as_ref() else {
                                warn!(
                                    target: "demo_player",
                                    "delta chunk at byte {offset} without a reference snapshot, skipped"
                                );
                                continue;
                            };
                            match self.delta.apply(reference, &body) {
                                Ok(snapshot) => {
                                    listener.on_snapshot(self.info.current_tick, &snapshot);
                                    self.last_snapshot = Some(snapshot);
                                }
                                // playback continues on the old reference
                                Err(e) => {
                                    warn!(target: "demo_player", "failed to apply delta: {e}");
                                }
                            }
                        }
                        ChunkKind::Snapshot => {
                            got_snapshot = true;
                            listener.on_snapshot(self.info.current_tick, &body);
                            self.last_snapshot = Some(body);
                        }
                        ChunkKind::Message => {
                            if !got_snapshot && let Some(last) = self.last_snapshot.as_ref() {
                                got_snapshot = true;
                                listener.on_snapshot(self.info.current_tick, last);
                            }
                            listener.on_message(self.info.current_tick, &body);
                        }
                    }
                }
            }
        }
    }

    /// Fast-forward until a previous tick is known, then anchor the
    /// playback clock there. Called after load and after seeks.
    pub fn play(&mut self, listener: &mut dyn DemoListener) {
        while self.info.previous_tick == -1 && self.is_playing() {
            self.do_tick(listener);
        }
        self.info.current_time_ns = tick_start_ns(self.info.previous_tick);
        self.last_update = self.clock.now();
    }

    /// Advance playback by the elapsed wall-clock time.
    ///
    /// With `real_time`, decodes ticks for as long as the current
    /// tick's scheduled time has already passed. Without it, decodes
    /// exactly one tick per call — the mode used for slicing and
    /// frame-by-frame export, where playback should run as fast as I/O
    /// allows.
    pub fn update(&mut self, listener: &mut dyn DemoListener, real_time: bool) {
        let now = self.clock.now();
        let elapsed = now - self.last_update;
        self.last_update = now;

        if !self.is_playing() || self.info.paused {
            return;
        }
        self.info.current_time_ns += (elapsed as f64 * self.info.speed as f64) as i64;

        if real_time {
            while tick_start_ns(self.info.current_tick) <= self.info.current_time_ns {
                self.do_tick(listener);
                if !self.is_playing() || self.info.paused {
                    return;
                }
            }
        } else {
            self.do_tick(listener);
            if !self.is_playing() || self.info.paused {
                return;
            }
        }

        self.update_intra();
        if self.info.current_tick == self.info.previous_tick
            || self.info.current_tick == self.info.next_tick
        {
            debug!(
                target: "demo_player",
                "tick error prev={} cur={} next={}",
                self.info.previous_tick, self.info.current_tick, self.info.next_tick
            );
        }
    }

    /// Seek to `wanted_tick`.
    ///
    /// Clamps into the demo's tick range, backs off a small margin so
    /// previous and current ticks exist after the seek, positions the
    /// file at the last keyframe at or before the target and
    /// fast-forwards tick by tick from there. Never a true
    /// random-access decode.
    pub fn set_pos(&mut self, listener: &mut dyn DemoListener, wanted_tick: i32) -> Result<(), DemoError> {
        let (first, last) = (self.info.first_tick, self.info.last_tick);
        let wanted = wanted_tick.clamp(first, last) - SEEK_MARGIN_TICKS;
        {
            let Some(loaded) = self.loaded.as_mut() else {
                return Err(DemoError::NotLoaded);
            };
            let after = loaded.keyframes.partition_point(|k| k.tick <= wanted);
            let offset = if after == 0 {
                loaded.chunks_start
            } else {
                loaded.keyframes[after - 1].offset
            };
            loaded.file.seek(SeekFrom::Start(offset))?;
        }
        self.info.previous_tick = -1;
        self.info.current_tick = -1;
        self.info.next_tick = -1;
        // the stream resumes at a keyframe, which carries a full snapshot
        self.last_snapshot = None;

        while self.info.previous_tick < wanted && self.is_playing() {
            self.do_tick(listener);
        }
        self.play(listener);
        Ok(())
    }

    /// Seek to a fraction of the demo's tick range.
    pub fn seek_percent(&mut self, listener: &mut dyn DemoListener, percent: f32) -> Result<(), DemoError> {
        let span = (self.info.last_tick - self.info.first_tick) as f32;
        let wanted = self.info.first_tick + (span * percent) as i32;
        self.set_pos(listener, wanted)
    }

    /// Seek relative to the current tick by a number of seconds.
    pub fn seek_time(&mut self, listener: &mut dyn DemoListener, seconds: f32) -> Result<(), DemoError> {
        let wanted = self.info.current_tick + (seconds * TICKS_PER_SECOND as f32) as i32;
        self.set_pos(listener, wanted)
    }

    /// Pause playback. No I/O.
    pub fn pause(&mut self) {
        self.info.paused = true;
    }

    /// Resume playback. No I/O.
    pub fn unpause(&mut self) {
        self.info.paused = false;
    }

    /// Set the speed multiplier, clamped to [0, 256].
    pub fn set_speed(&mut self, speed: f32) {
        self.info.speed = speed.clamp(0.0, 256.0);
    }

    /// Step through the speed presets by `offset` entries.
    pub fn nudge_speed(&mut self, offset: i32) {
        let index = (self.speed_index as i32 + offset).clamp(0, SPEEDS.len() as i32 - 1);
        self.speed_index = index as usize;
        self.set_speed(SPEEDS[self.speed_index]);
    }

    /// Unload the demo, releasing the file handle and keyframe index.
    pub fn stop(&mut self) -> Result<(), DemoError> {
        if self.loaded.is_none() {
            return Err(DemoError::NotLoaded);
        }
        self.stop_internal();
        Ok(())
    }

    fn stop_internal(&mut self) {
        if self.loaded.take().is_some() {
            info!(target: "demo_player", "stopped playback");
        }
    }

    /// Write the embedded map into the download cache, returning the
    /// absolute path. For files predating the digest extension the
    /// digest is computed from the map bytes. Idempotent.
    pub fn extract_map(&mut self, storage: &Storage) -> Result<PathBuf, DemoError> {
        let Some(loaded) = self.loaded.as_mut() else {
            return Err(DemoError::NotLoaded);
        };
        if loaded.map.size == 0 {
            return Err(DemoError::NoMapData);
        }

        let resume = loaded.file.stream_position()?;
        loaded.file.seek(SeekFrom::Start(loaded.map_offset))?;
        let mut bytes = vec![0u8; loaded.map.size as usize];
        loaded.file.read_exact(&mut bytes)?;
        loaded.file.seek(SeekFrom::Start(resume))?;

        let sha256 = match loaded.map.sha256 {
            Some(digest) => digest,
            None => {
                let digest: [u8; 32] = Sha256::digest(&bytes).into();
                loaded.map.sha256 = Some(digest);
                digest
            }
        };

        let relative = Storage::map_cache_path(&loaded.map.name, &sha256);
        let mut out = storage.create_write(&relative)?;
        out.write_all(&bytes)?;
        Ok(storage.path(relative))
    }

    fn update_intra(&mut self) {
        let cur = tick_start_ns(self.info.current_tick);
        let prev = tick_start_ns(self.info.previous_tick);
        if cur > prev {
            self.info.intra_tick = (self.info.current_time_ns - prev) as f32 / (cur - prev) as f32;
        }
    }
}

/// Read a demo's header-level metadata without scanning the chunk
/// stream or building an index. Cheap enough for demo browsing.
pub fn demo_info(storage: &Storage, path: &str) -> Result<DemoInfo, DemoError> {
    let mut file = BufReader::new(storage.open_read(path)?);
    let header = DemoHeader::read_from(&mut file)?;

    let mut timeline = TimelineMarkers::default();
    if header.version > OLDEST_VERSION {
        timeline = TimelineMarkers::read_from(&mut file)?;
    }

    let mut sha256 = None;
    if header.version >= DIGEST_VERSION {
        let mut id = [0u8; 16];
        file.read_exact(&mut id)?;
        if id == EXTENSION_ID {
            let mut digest = [0u8; 32];
            file.read_exact(&mut digest)?;
            sha256 = Some(digest);
        } else {
            file.seek_relative(-16)?;
        }
    }

    Ok(DemoInfo {
        map: MapInfo {
            name: header.map_name.clone(),
            size: header.map_size,
            crc: header.map_crc,
            sha256,
        },
        timeline_markers: timeline.ticks,
        header,
    })
}

fn tick_start_ns(tick: i32) -> i64 {
    tick as i64 * NANOS_PER_SEC / TICKS_PER_SECOND as i64
}

/// Forward scan over the chunk stream: collect keyframe positions and
/// the first/last tick, then rewind to where the scan began. A
/// truncated tail ends the scan early; playback will stop at the same
/// place.
fn scan_file(
    file: &mut BufReader<File>,
    version: u8,
) -> Result<(Vec<Keyframe>, i32, i32), DemoError> {
    let start = file.stream_position()?;
    let mut keyframes = Vec::new();
    let mut first_tick = -1;
    let mut last_tick = -1;
    let mut tick = 0;

    loop {
        let offset = file.stream_position()?;
        match ChunkHeader::read(file, version, tick, offset) {
            Ok(None) => break,
            Ok(Some(ChunkHeader::Tick { tick: t, keyframe })) => {
                if keyframe {
                    keyframes.push(Keyframe { tick: t, offset });
                }
                if first_tick == -1 {
                    first_tick = t;
                }
                last_tick = t;
                tick = t;
            }
            Ok(Some(ChunkHeader::Payload { size, .. })) => {
                file.seek_relative(size as i64)?;
            }
            Err(e @ DemoError::ChunkTooLarge { .. }) => return Err(e),
            Err(e) => {
                warn!(target: "demo_player", "scan stopped early: {e}");
                break;
            }
        }
    }

    file.seek(SeekFrom::Start(start))?;
    Ok((keyframes, first_tick, last_tick))
}
