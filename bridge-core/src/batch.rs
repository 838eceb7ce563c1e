//! Fixed-size signing rounds.

use std::ops::Range;

/// Default number of hashes signed per round trip to the agent.
pub const DEFAULT_BATCH_CHUNK: usize = 1000;

/// Split `total` items into consecutive ranges of at most `chunk` items.
///
/// A `chunk` of zero is treated as one.
pub fn rounds(total: usize, chunk: usize) -> impl Iterator<Item = Range<usize>> {
    let chunk = chunk.max(1);
    (0..total)
        .step_by(chunk)
        .map(move |start| start..(start + chunk).min(total))
}
