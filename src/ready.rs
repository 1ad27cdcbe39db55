//! Stdout ready markers.
//!
//! A daemon writes exactly one marker to stdout in its lifetime: `READY`
//! once it is listening and has committed leadership, or `ALREADY RUNNING`
//! when it defers to a live peer. The spawning client only waits for the
//! first stdout byte; the marker text is for humans running the daemon
//! interactively.

use std::io::Write;

/// Written once the daemon is listening and committed.
pub const READY: &str = "READY";

/// Written when the daemon defers to an already-running peer.
pub const ALREADY_RUNNING: &str = "ALREADY RUNNING";

/// Write a marker (plus newline) to stdout and flush it, so the spawner's
/// one-byte watch fires immediately. Failures are absorbed: a daemon whose
/// stdout is gone still serves.
pub fn announce(marker: &str) {
    let mut out = std::io::stdout();
    let _ = writeln!(out, "{marker}");
    let _ = out.flush();
}
