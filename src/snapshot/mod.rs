//! Snapshot differencing contract.
//!
//! The demo subsystem stores most ticks as binary deltas against the
//! last full snapshot. How those deltas are computed is the simulation's
//! business; recorder and player only need the two operations below.

/// Largest snapshot (and therefore chunk payload) the format accepts.
pub const MAX_SNAPSHOT_SIZE: usize = 64 * 1024;

/// A delta could not be applied to the reference snapshot.
#[derive(Debug, thiserror::Error)]
#[error("failed to apply snapshot delta: {reason}")]
pub struct DeltaError {
    /// What went wrong, for diagnostics.
    pub reason: String,
}

impl DeltaError {
    /// Build an error from any displayable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Computes and applies binary deltas between opaque state snapshots.
///
/// `diff` may return an empty buffer to signal "no change"; the recorder
/// then writes nothing for that tick. `apply` must reconstruct exactly
/// the buffer that `diff` was given as `cur`.
pub trait SnapshotDelta {
    /// Compute a delta that transforms `prev` into `cur`.
    fn diff(&self, prev: &[u8], cur: &[u8]) -> Vec<u8>;
    /// Reconstruct the current snapshot from `prev` and a delta.
    fn apply(&self, prev: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError>;
}

/// Trivial differencer: the delta is the full new snapshot.
///
/// Produces no compression benefit but satisfies the contract, which
/// makes it useful for tests and for callers without a real differencer.
pub struct VerbatimDelta;

impl SnapshotDelta for VerbatimDelta {
    fn diff(&self, prev: &[u8], cur: &[u8]) -> Vec<u8> {
        if prev == cur { Vec::new() } else { cur.to_vec() }
    }

    fn apply(&self, _prev: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
        Ok(delta.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_reports_no_change_as_empty() {
        let d = VerbatimDelta;
        assert!(d.diff(b"same", b"same").is_empty());
        assert_eq!(d.diff(b"old", b"new"), b"new");
    }

    #[test]
    fn verbatim_apply_ignores_reference() {
        let d = VerbatimDelta;
        let delta = d.diff(b"old", b"new");
        assert_eq!(d.apply(b"garbage", &delta).unwrap(), b"new");
    }
}
