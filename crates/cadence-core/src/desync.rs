//! Desynchronization detection from rolling hashes.
//!
//! Peers exchange [`DesyncPacket`]s after every tick. The comparator walks
//! the window of frames both packets cover and checks hashes slot by slot.
//! The channel is unreliable and unordered, so nothing here is acted on
//! automatically: input mismatches are logged, save mismatches are recorded
//! per peer (first offending frame) and cleared once a later frame agrees.

use cadence_proto::{DELAY_BUFFER_SIZE, DesyncPacket, PortState};

/// Compare two desync packets over their overlapping frame window.
///
/// `previously_desynced` is the frame recorded for this peer so far, 0 for
/// none; the return value is its updated state.
#[must_use]
pub fn compare(ours: &DesyncPacket, theirs: &DesyncPacket, previously_desynced: i64) -> i64 {
    let latest_common = ours.frame().min(theirs.frame());
    let difference = (ours.frame() - theirs.frame()).abs();
    let frames_to_compare = DELAY_BUFFER_SIZE as i64 - difference;

    let mut desynced_frame = previously_desynced;

    for back in (0..frames_to_compare).rev() {
        let frame = latest_common - back;
        if frame < 0 {
            continue;
        }
        let slot = PortState::slot(frame);

        if ours.input_hash(slot) != theirs.input_hash(slot) {
            tracing::error!(
                frame,
                ours = format_args!("{:#018x}", ours.input_hash(slot)),
                theirs = format_args!("{:#018x}", theirs.input_hash(slot)),
                "input state hash mismatch"
            );
        } else if ours.save_hash(slot) != 0 && theirs.save_hash(slot) != 0 {
            if ours.save_hash(slot) != theirs.save_hash(slot) {
                if desynced_frame == 0 {
                    desynced_frame = frame;
                }
                tracing::error!(
                    frame,
                    ours = format_args!("{:#018x}", ours.save_hash(slot)),
                    theirs = format_args!("{:#018x}", theirs.save_hash(slot)),
                    "save state hash mismatch"
                );
            } else if desynced_frame != 0 {
                desynced_frame = 0;
                tracing::info!(frame, "peer resynced");
            }
        }
    }

    desynced_frame
}
