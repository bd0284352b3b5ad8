//! The transmitter thread: rings in, container out.
//!
//! One sweep visits every thread record, drains its ring chain completely,
//! and inserts each descriptor into the container. A record that yields
//! nothing gets a liveness probe (`pthread_kill(tid, 0)`); once its owner is
//! gone its slot is cleared for reuse by the next new thread. Records
//! themselves are never unlinked, keeping the sweep wait-free.
//!
//! After ten consecutive empty sweeps the program is considered still and
//! the thread naps for a millisecond to stay off idle-host profiles.

use std::time::Duration;

use crate::context::{Context, ExitPhase};
use crate::interceptor::unprotected;
use crate::metrics::Metrics;

/// Empty sweeps tolerated before napping.
const STILL_SWEEPS: u32 = 10;

/// Transmitter thread body.
pub(crate) fn transmitter_loop(ctx: &'static Context) {
    // The transmitter's own allocations go straight to the host.
    let _guard = unprotected();

    while !ctx.is_ready() {
        std::thread::yield_now();
    }

    let mut still = 0u32;
    loop {
        let mut moved = 0u64;
        for record in ctx.records.iter() {
            let tid = record.thread_id();
            if tid == 0 {
                continue;
            }
            let mut drained_any = false;
            // SAFETY: this thread is the sole consumer of every record.
            while let Some(node) = unsafe { record.consume() } {
                drained_any = true;
                moved += 1;
                // SAFETY: this thread is the container's sole inserter.
                unsafe { ctx.container.insert(node) };
            }
            if !drained_any && thread_is_gone(tid) {
                record.release_slot();
            }
        }
        if moved > 0 {
            Metrics::add(&ctx.metrics.transmitted, moved);
        }

        match ctx.exit_phase() {
            ExitPhase::ExitHooked => {
                // One more full sweep so the monitor's final rounds see
                // everything produced before shutdown.
                ctx.set_exit_phase(ExitPhase::TransmitterBegin);
                continue;
            }
            ExitPhase::TransmitterBegin => {
                ctx.set_exit_phase(ExitPhase::TransmitterDone);
                return;
            }
            _ => {}
        }

        if moved == 0 {
            still += 1;
            if still > STILL_SWEEPS {
                std::thread::sleep(Duration::from_millis(1));
            }
        } else {
            still = 0;
        }
    }
}

/// Signal-zero probe: does the owning thread still exist?
fn thread_is_gone(tid: usize) -> bool {
    // SAFETY: a probe with signal 0 delivers nothing; a stale id yields
    // ESRCH, which is exactly the case being detected.
    unsafe { libc::pthread_kill(tid as libc::pthread_t, 0) == libc::ESRCH }
}
