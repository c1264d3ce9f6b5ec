//! Demo recorder for capturing live simulation sessions.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use chrono::Local;
use log::{info, warn};

use super::format::{
    CURRENT_VERSION, ChunkKind, DemoHeader, EXTENSION_ID, LENGTH_OFFSET, MARKERS_OFFSET,
    MAX_TIMELINE_MARKERS, TimelineMarkers, write_payload_header, write_tick_marker,
};
use super::{DemoError, DemoKind, TICKS_PER_SECOND};
use crate::codec;
use crate::snapshot::{MAX_SNAPSHOT_SIZE, SnapshotDelta};
use crate::storage::Storage;

/// A keyframe (full snapshot) is forced after this many ticks.
const KEYFRAME_INTERVAL_TICKS: i32 = TICKS_PER_SECOND * 5;

/// Minimum tick distance between two timeline markers.
const MARKER_MIN_GAP_TICKS: i32 = TICKS_PER_SECOND;

/// Decides whether a message is dropped from the recording.
/// Returning `true` drops the message.
pub type MessageFilter<'a> = Box<dyn FnMut(&[u8]) -> bool + 'a>;

/// Where the embedded map comes from.
pub enum MapSource<'a> {
    /// Caller-supplied map bytes.
    Bytes(&'a [u8]),
    /// Caller-supplied open map file, read from the start.
    File(File),
    /// Look the map up through [`Storage`] by name and digest/CRC.
    Resolve,
    /// Record without embedding a map; the header map size is zero.
    Omit,
}

/// Session metadata written into the demo header.
pub struct RecordMeta<'a> {
    /// Network protocol version of the session.
    pub net_version: &'a str,
    /// Map the session is played on.
    pub map_name: &'a str,
    /// SHA-256 of the map, when known.
    pub map_sha256: Option<[u8; 32]>,
    /// CRC of the map.
    pub map_crc: u32,
    /// Which side is recording.
    pub kind: DemoKind,
}

struct Recording<'a> {
    writer: BufWriter<File>,
    /// File offset where the chunk stream begins.
    data_start: u64,
    last_keyframe: i32,
    last_tick_marker: i32,
    /// Last accepted snapshot, the reference deltas are computed against.
    reference: Vec<u8>,
    markers: Vec<i32>,
    filter: Option<MessageFilter<'a>>,
}

/// Appends tick markers, snapshots, deltas and messages to a demo file.
///
/// State machine: Idle → Recording → Idle. [`DemoRecorder::stop`]
/// patches the header length and timeline-marker trailer fields, which
/// are placeholders until the stream length is known.
///
/// Chunk write failures are non-fatal: the chunk is dropped with a
/// warning and recording continues, so one bad write never aborts a
/// live session.
pub struct DemoRecorder<'a> {
    delta: &'a dyn SnapshotDelta,
    recording: Option<Recording<'a>>,
}

impl<'a> DemoRecorder<'a> {
    /// Create an idle recorder using the given differencer.
    pub fn new(delta: &'a dyn SnapshotDelta) -> Self {
        Self {
            delta,
            recording: None,
        }
    }

    /// Whether a recording is in progress.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Begin recording to the root-relative `path`.
    ///
    /// The map source is resolved before the destination is opened, so
    /// a missing map aborts the call with nothing written. On success
    /// the header, a zeroed timeline-marker block, the digest extension
    /// and the map bytes are in place and the recorder is ready for
    /// [`DemoRecorder::record_snapshot`] calls.
    pub fn start(
        &mut self,
        storage: &Storage,
        path: &str,
        meta: &RecordMeta<'_>,
        map: MapSource<'_>,
        filter: Option<MessageFilter<'a>>,
    ) -> Result<(), DemoError> {
        if self.recording.is_some() {
            return Err(DemoError::AlreadyRecording);
        }

        enum Resolved<'m> {
            Bytes(&'m [u8]),
            File(File),
            Omit,
        }
        let (resolved, map_size) = match map {
            MapSource::Bytes(bytes) => (Resolved::Bytes(bytes), bytes.len() as u32),
            MapSource::File(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                let size = file.metadata()?.len() as u32;
                (Resolved::File(file), size)
            }
            MapSource::Resolve => {
                let found = storage
                    .find_map(meta.map_name, meta.map_sha256.as_ref(), meta.map_crc)
                    .ok_or_else(|| DemoError::MapNotFound {
                        name: meta.map_name.to_owned(),
                    })?;
                let file = File::open(found)?;
                let size = file.metadata()?.len() as u32;
                (Resolved::File(file), size)
            }
            MapSource::Omit => (Resolved::Omit, 0),
        };

        let mut writer = BufWriter::new(storage.create_write(path)?);

        let header = DemoHeader {
            version: CURRENT_VERSION,
            net_version: meta.net_version.to_owned(),
            map_name: meta.map_name.to_owned(),
            map_size,
            map_crc: meta.map_crc,
            kind: meta.kind,
            length: 0, // patched on stop
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        header.write_to(&mut writer)?;
        TimelineMarkers::default().write_to(&mut writer)?; // patched on stop
        writer.write_all(&EXTENSION_ID)?;
        writer.write_all(&meta.map_sha256.unwrap_or([0u8; 32]))?;

        match resolved {
            Resolved::Bytes(bytes) => writer.write_all(bytes)?,
            Resolved::File(mut file) => {
                io::copy(&mut file, &mut writer)?;
            }
            Resolved::Omit => {}
        }

        let data_start = writer.stream_position()?;
        info!(target: "demo_recorder", "recording to '{path}'");
        self.recording = Some(Recording {
            writer,
            data_start,
            last_keyframe: -1,
            last_tick_marker: -1,
            reference: Vec::new(),
            markers: Vec::new(),
            filter,
        });
        Ok(())
    }

    /// Record the full simulation state for `tick`.
    ///
    /// Writes a keyframe (tick marker plus full snapshot) when none
    /// exists yet or the last one is more than five seconds of ticks
    /// old; otherwise writes a plain tick marker and a delta against
    /// the reference snapshot. A differencer reporting no change writes
    /// nothing for the tick, but the tick marker is still consumed; the
    /// reference advances only when a chunk was produced.
    pub fn record_snapshot(&mut self, tick: i32, data: &[u8]) -> Result<(), DemoError> {
        let rec = self.recording.as_mut().ok_or(DemoError::NotRecording)?;
        if rec.last_keyframe == -1 || tick - rec.last_keyframe > KEYFRAME_INTERVAL_TICKS {
            rec.write_marker(tick, true);
            rec.write_chunk(ChunkKind::Snapshot, data);
            rec.last_keyframe = tick;
            rec.reference = data.to_vec();
        } else {
            rec.write_marker(tick, false);
            let delta = self.delta.diff(&rec.reference, data);
            if !delta.is_empty() {
                rec.write_chunk(ChunkKind::Delta, &delta);
                rec.reference = data.to_vec();
            }
        }
        Ok(())
    }

    /// Record a game message, subject to the installed filter.
    pub fn record_message(&mut self, data: &[u8]) -> Result<(), DemoError> {
        let rec = self.recording.as_mut().ok_or(DemoError::NotRecording)?;
        if let Some(filter) = rec.filter.as_mut()
            && filter(data)
        {
            return Ok(());
        }
        rec.write_chunk(ChunkKind::Message, data);
        Ok(())
    }

    /// Flag the current tick as a timeline marker.
    ///
    /// Returns whether the marker was stored. Rejected when no tick has
    /// been recorded yet, the marker table is full, or the previous
    /// marker is less than one second of ticks away.
    pub fn add_marker(&mut self) -> Result<bool, DemoError> {
        let rec = self.recording.as_mut().ok_or(DemoError::NotRecording)?;
        if rec.last_tick_marker < 0 || rec.markers.len() >= MAX_TIMELINE_MARKERS {
            return Ok(false);
        }
        if let Some(last) = rec.markers.last()
            && rec.last_tick_marker - last < MARKER_MIN_GAP_TICKS
        {
            return Ok(false);
        }
        rec.markers.push(rec.last_tick_marker);
        info!(target: "demo_recorder", "added timeline marker at tick {}", rec.last_tick_marker);
        Ok(true)
    }

    /// Store a timeline marker at an explicit tick, used when carrying
    /// markers over from another demo. Capacity and duplicate checks
    /// apply, but not the rate limit of [`DemoRecorder::add_marker`].
    pub fn mark_tick(&mut self, tick: i32) -> Result<bool, DemoError> {
        let rec = self.recording.as_mut().ok_or(DemoError::NotRecording)?;
        if tick < 0 || rec.markers.len() >= MAX_TIMELINE_MARKERS || rec.markers.last() == Some(&tick)
        {
            return Ok(false);
        }
        rec.markers.push(tick);
        Ok(true)
    }

    /// Finish the recording.
    ///
    /// Seeks back to the fixed trailer offsets, patches the chunk
    /// stream length and the timeline markers, and closes the file.
    pub fn stop(&mut self) -> Result<(), DemoError> {
        let mut rec = self.recording.take().ok_or(DemoError::NotRecording)?;
        let end = rec.writer.stream_position()?;
        let length = (end - rec.data_start) as u32;

        rec.writer.seek(SeekFrom::Start(LENGTH_OFFSET))?;
        rec.writer.write_all(&length.to_be_bytes())?;
        rec.writer.seek(SeekFrom::Start(MARKERS_OFFSET))?;
        TimelineMarkers { ticks: rec.markers }.write_to(&mut rec.writer)?;
        rec.writer.flush()?;

        info!(target: "demo_recorder", "stopped recording, {length} chunk bytes");
        Ok(())
    }
}

impl Recording<'_> {
    fn write_marker(&mut self, tick: i32, keyframe: bool) {
        if let Err(e) = write_tick_marker(&mut self.writer, tick, keyframe, self.last_tick_marker) {
            warn!(target: "demo_recorder", "dropped tick marker for tick {tick}: {e}");
            return;
        }
        self.last_tick_marker = tick;
    }

    fn write_chunk(&mut self, kind: ChunkKind, data: &[u8]) {
        if data.len() > MAX_SNAPSHOT_SIZE {
            warn!(
                target: "demo_recorder",
                "dropped {} byte chunk, larger than the {MAX_SNAPSHOT_SIZE} byte limit",
                data.len()
            );
            return;
        }

        // the varint codec expects 4-byte alignment
        let mut padded = data.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        let packed = match codec::pack_ints(&padded) {
            Ok(packed) => packed,
            Err(e) => {
                warn!(target: "demo_recorder", "dropped chunk, varint stage failed: {e}");
                return;
            }
        };
        let compressed = codec::compress(&packed);
        if compressed.len() > u16::MAX as usize {
            warn!(
                target: "demo_recorder",
                "dropped chunk, {} bytes after compression does not fit the size field",
                compressed.len()
            );
            return;
        }

        let written = write_payload_header(&mut self.writer, kind, compressed.len())
            .and_then(|()| self.writer.write_all(&compressed));
        if let Err(e) = written {
            warn!(target: "demo_recorder", "dropped chunk: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::format::ChunkHeader;
    use crate::snapshot::VerbatimDelta;
    use std::cell::Cell;
    use std::io::{BufReader, Read, Seek};
    use tempfile::tempdir;

    fn meta<'a>() -> RecordMeta<'a> {
        RecordMeta {
            net_version: "0.7.5",
            map_name: "arena",
            map_sha256: Some([0x11; 32]),
            map_crc: 0xcafebabe,
            kind: DemoKind::Client,
        }
    }

    /// Read back the chunk stream of a finished demo, returning
    /// (header, chunk headers, chunk stream start offset, file length).
    fn scan_chunks(storage: &Storage, path: &str) -> (DemoHeader, Vec<ChunkHeader>, u64, u64) {
        let mut reader = BufReader::new(storage.open_read(path).unwrap());
        let header = DemoHeader::read_from(&mut reader).unwrap();
        TimelineMarkers::read_from(&mut reader).unwrap();
        let mut ext = [0u8; 16 + 32];
        reader.read_exact(&mut ext).unwrap();
        let mut map = vec![0u8; header.map_size as usize];
        reader.read_exact(&mut map).unwrap();

        let data_start = reader.stream_position().unwrap();
        let mut chunks = Vec::new();
        let mut tick = 0;
        loop {
            let offset = reader.stream_position().unwrap();
            match ChunkHeader::read(&mut reader, header.version, tick, offset).unwrap() {
                None => break,
                Some(h) => {
                    match h {
                        ChunkHeader::Tick { tick: t, .. } => tick = t,
                        ChunkHeader::Payload { size, .. } => {
                            std::io::copy(
                                &mut reader.by_ref().take(size as u64),
                                &mut std::io::sink(),
                            )
                            .unwrap();
                        }
                    }
                    chunks.push(h);
                }
            }
        }
        let len = reader.stream_position().unwrap();
        (header, chunks, data_start, len)
    }

    #[test]
    fn start_twice_fails() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "a.demo", &meta(), MapSource::Bytes(b"map"), None)
            .unwrap();
        assert!(matches!(
            rec.start(&storage, "b.demo", &meta(), MapSource::Bytes(b"map"), None),
            Err(DemoError::AlreadyRecording)
        ));
        rec.stop().unwrap();
    }

    #[test]
    fn stop_without_start_fails() {
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        assert!(matches!(rec.stop(), Err(DemoError::NotRecording)));
        assert!(matches!(rec.record_snapshot(0, b"x"), Err(DemoError::NotRecording)));
    }

    #[test]
    fn missing_map_aborts_with_nothing_written() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        assert!(matches!(
            rec.start(&storage, "a.demo", &meta(), MapSource::Resolve, None),
            Err(DemoError::MapNotFound { .. })
        ));
        assert!(!storage.path("a.demo").exists());
        assert!(!rec.is_recording());
    }

    #[test]
    fn keyframe_schedule_and_patched_length() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "ten_seconds.demo", &meta(), MapSource::Bytes(b"mapdata"), None)
            .unwrap();

        // 10 seconds at 50 ticks/s, every tick slightly different
        for tick in 0..(TICKS_PER_SECOND * 10) {
            let snap = [tick as u8; 64];
            rec.record_snapshot(tick, &snap).unwrap();
        }
        rec.stop().unwrap();

        let (header, chunks, data_start, file_len) = scan_chunks(&storage, "ten_seconds.demo");
        assert_eq!(header.length as u64, file_len - data_start);

        let mut reader = BufReader::new(storage.open_read("ten_seconds.demo").unwrap());
        DemoHeader::read_from(&mut reader).unwrap();
        assert!(TimelineMarkers::read_from(&mut reader).unwrap().ticks.is_empty());

        let keyframes = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Tick { keyframe: true, .. }))
            .count();
        assert_eq!(keyframes, 2);
        let snapshots = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Payload { kind: ChunkKind::Snapshot, .. }))
            .count();
        assert_eq!(snapshots, 2);
        let deltas = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Payload { kind: ChunkKind::Delta, .. }))
            .count();
        assert_eq!(deltas, TICKS_PER_SECOND as usize * 10 - 2);
    }

    #[test]
    fn no_diff_across_forced_keyframe() {
        struct CountingDelta {
            diffs: Cell<usize>,
        }
        impl SnapshotDelta for CountingDelta {
            fn diff(&self, _prev: &[u8], cur: &[u8]) -> Vec<u8> {
                self.diffs.set(self.diffs.get() + 1);
                cur.to_vec()
            }
            fn apply(&self, _prev: &[u8], delta: &[u8]) -> Result<Vec<u8>, crate::snapshot::DeltaError> {
                Ok(delta.to_vec())
            }
        }

        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = CountingDelta { diffs: Cell::new(0) };
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "kf.demo", &meta(), MapSource::Omit, None).unwrap();
        rec.record_snapshot(0, b"s1").unwrap();
        // far enough in the future to force a keyframe
        rec.record_snapshot(KEYFRAME_INTERVAL_TICKS + 1, b"s2").unwrap();
        rec.stop().unwrap();
        assert_eq!(delta.diffs.get(), 0);
    }

    #[test]
    fn unchanged_snapshot_writes_marker_but_no_chunk() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "idle.demo", &meta(), MapSource::Omit, None).unwrap();
        rec.record_snapshot(0, b"same").unwrap();
        rec.record_snapshot(1, b"same").unwrap();
        rec.record_snapshot(2, b"same").unwrap();
        rec.stop().unwrap();

        let (_, chunks, _, _) = scan_chunks(&storage, "idle.demo");
        let markers = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Tick { .. }))
            .count();
        let payloads = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Payload { .. }))
            .count();
        assert_eq!(markers, 3);
        assert_eq!(payloads, 1); // only the initial keyframe snapshot
    }

    #[test]
    fn marker_rate_limit() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "markers.demo", &meta(), MapSource::Omit, None).unwrap();

        rec.record_snapshot(100, b"a").unwrap();
        assert!(rec.add_marker().unwrap());
        rec.record_snapshot(100 + TICKS_PER_SECOND / 2, b"b").unwrap();
        assert!(!rec.add_marker().unwrap()); // within one second
        rec.record_snapshot(100 + 2 * TICKS_PER_SECOND, b"c").unwrap();
        assert!(rec.add_marker().unwrap());
        rec.stop().unwrap();

        let mut reader = BufReader::new(storage.open_read("markers.demo").unwrap());
        DemoHeader::read_from(&mut reader).unwrap();
        let markers = TimelineMarkers::read_from(&mut reader).unwrap();
        assert_eq!(markers.ticks, vec![100, 100 + 2 * TICKS_PER_SECOND]);
    }

    #[test]
    fn message_filter_drops() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        let filter: MessageFilter = Box::new(|msg: &[u8]| msg.starts_with(b"secret"));
        rec.start(&storage, "filtered.demo", &meta(), MapSource::Omit, Some(filter))
            .unwrap();
        rec.record_snapshot(0, b"snap").unwrap();
        rec.record_message(b"secret handshake").unwrap();
        rec.record_message(b"public chat").unwrap();
        rec.stop().unwrap();

        let (_, chunks, _, _) = scan_chunks(&storage, "filtered.demo");
        let messages = chunks
            .iter()
            .filter(|c| matches!(c, ChunkHeader::Payload { kind: ChunkKind::Message, .. }))
            .count();
        assert_eq!(messages, 1);
    }

    #[test]
    fn map_file_source_is_streamed() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let map_bytes: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let mut f = storage.create_write("maps/arena.map").unwrap();
        f.write_all(&map_bytes).unwrap();
        drop(f);

        let delta = VerbatimDelta;
        let mut rec = DemoRecorder::new(&delta);
        rec.start(&storage, "mapped.demo", &meta(), MapSource::Resolve, None)
            .unwrap();
        rec.record_snapshot(0, b"snap").unwrap();
        rec.stop().unwrap();

        let mut reader = BufReader::new(storage.open_read("mapped.demo").unwrap());
        let header = DemoHeader::read_from(&mut reader).unwrap();
        assert_eq!(header.map_size as usize, map_bytes.len());
        TimelineMarkers::read_from(&mut reader).unwrap();
        let mut ext = [0u8; 48];
        reader.read_exact(&mut ext).unwrap();
        let mut embedded = vec![0u8; map_bytes.len()];
        reader.read_exact(&mut embedded).unwrap();
        assert_eq!(embedded, map_bytes);
    }
}
