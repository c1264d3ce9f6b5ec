//! Demo slicing: cut a tick range out of a demo into a new file.

use log::info;

use super::player::DemoPlayer;
use super::recorder::{DemoRecorder, MapSource, MessageFilter, RecordMeta};
use super::{DemoError, DemoListener};
use crate::snapshot::SnapshotDelta;
use crate::storage::Storage;

/// Inclusive tick range to keep. `None` on either side means unbounded,
/// so `SliceBounds::default()` copies the whole demo.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceBounds {
    /// First tick to keep.
    pub from: Option<i32>,
    /// Last tick to keep.
    pub to: Option<i32>,
}

impl SliceBounds {
    fn contains(&self, tick: i32) -> bool {
        self.from.is_none_or(|from| tick >= from) && self.to.is_none_or(|to| tick <= to)
    }

    fn past(&self, tick: i32) -> bool {
        self.to.is_some_and(|to| tick > to)
    }
}

/// Forwards playback output into a recorder while inside the bounds.
struct Slicer<'r, 'a> {
    recorder: &'r mut DemoRecorder<'a>,
    bounds: SliceBounds,
    done: bool,
}

impl Slicer<'_, '_> {
    fn admit(&mut self, tick: i32) -> bool {
        if self.bounds.past(tick) {
            self.done = true;
            return false;
        }
        self.bounds.contains(tick)
    }
}

impl DemoListener for Slicer<'_, '_> {
    fn on_snapshot(&mut self, tick: i32, data: &[u8]) {
        if self.admit(tick) {
            // the recorder is never torn down mid-slice, so the only
            // failure mode is a logged write error inside it
            let _ = self.recorder.record_snapshot(tick, data);
        }
    }

    fn on_message(&mut self, tick: i32, data: &[u8]) {
        if self.admit(tick) {
            let _ = self.recorder.record_message(data);
        }
    }
}

/// Write the `bounds` tick range of the demo at `src` to a new demo at
/// `dst`, re-encoding through full decode.
///
/// The source is played back as fast as I/O allows and everything the
/// playback delivers inside the bounds is re-recorded, so the result is
/// a first-class demo: fresh header, map copied over, keyframes
/// rescheduled, length and timeline markers patched on finish. Timeline
/// markers inside the kept range survive; an optional message `filter`
/// drops messages on the way through (returning `true` drops). An
/// unbounded slice is a lossless re-encode of the playable stream.
pub fn slice<'a>(
    storage: &Storage,
    delta: &'a dyn SnapshotDelta,
    src: &str,
    dst: &str,
    bounds: SliceBounds,
    filter: Option<MessageFilter<'a>>,
) -> Result<(), DemoError> {
    let mut player = DemoPlayer::new(delta);
    player.load(storage, src)?;

    let header = player.header().cloned().ok_or(DemoError::NotLoaded)?;
    let map = player.map_info().cloned().ok_or(DemoError::NotLoaded)?;

    // stage the embedded map in the cache so the new recording can
    // resolve it by name and digest
    let map_source = if map.size == 0 {
        MapSource::Omit
    } else {
        player.extract_map(storage)?;
        MapSource::Resolve
    };
    // extraction may have computed a digest the old header lacked
    let map_sha256 = player.map_info().and_then(|m| m.sha256);

    let markers: Vec<i32> = player
        .info()
        .timeline_markers
        .iter()
        .copied()
        .filter(|&t| bounds.contains(t))
        .collect();

    let mut recorder = DemoRecorder::new(delta);
    recorder.start(
        storage,
        dst,
        &RecordMeta {
            net_version: &header.net_version,
            map_name: &map.name,
            map_sha256,
            map_crc: map.crc,
            kind: header.kind,
        },
        map_source,
        filter,
    )?;

    let mut slicer = Slicer {
        recorder: &mut recorder,
        bounds,
        done: false,
    };
    player.play(&mut slicer);
    while player.is_playing() && !player.info().paused && !slicer.done {
        player.update(&mut slicer, false);
    }

    for tick in markers {
        slicer.recorder.mark_tick(tick)?;
    }

    if player.is_playing() {
        player.stop()?;
    }
    recorder.stop()?;
    info!(target: "demo_editor", "sliced '{src}' into '{dst}'");
    Ok(())
}
