//! The monitor thread: round after round of canary verification.
//!
//! Each round is one traversal of the descriptor container. The per-buffer
//! check depends on the mode:
//!
//! - **Lazy**: the buffer is still mapped even after `free` (the mutator only
//!   flags the head word), so the monitor reads it directly. A head equal to
//!   the realloc tombstone means "being resized, come back next round"; a
//!   head that changed between the size read and its re-read means a resize
//!   just completed and the size may be stale, same answer. A freed head
//!   triggers the final tail verification and the actual release to the host.
//! - **Eager**: `free` already returned the region, so any address in the
//!   descriptor may be unmapped by the time the monitor looks. Every word is
//!   fetched with a `process_vm_readv` self-read, which turns a fault into an
//!   error return instead of SIGSEGV; a failed read means the region is gone
//!   and the descriptor is dropped. The tail is trusted only if the identity
//!   word matches the descriptor both before and after the tail read, which
//!   rules out a free racing between the two.
//!
//! A detected attack is reported once and its descriptor dropped; under the
//! default abort policy the process is already gone, and under `continue` a
//! corrupted buffer would otherwise be re-reported every round.

use std::sync::atomic::Ordering;

use crate::canary::{Capsule, WORD_BYTES};
use crate::config::Mode;
use crate::context::{Context, ExitPhase};
use crate::interceptor::unprotected;
use crate::list::Verdict;
use crate::metrics::Metrics;
use crate::report::{self, AttackSite};
use crate::ring::Descriptor;
use crate::transmitter::transmitter_loop;

/// Monitor thread body. Spawns the transmitter, then loops traversals until
/// the exit handshake completes.
pub(crate) fn monitor_loop(ctx: &'static Context) {
    // The monitor's own allocations go straight to the host.
    let _guard = unprotected();

    if std::thread::Builder::new()
        .name("cruiser-transmitter".into())
        .spawn(move || transmitter_loop(ctx))
        .is_err()
    {
        report::fatal_thread_spawn("transmitter");
    }

    while !ctx.is_ready() {
        std::thread::yield_now();
    }

    loop {
        let mut checks = 0u64;
        let mut live = 0u64;
        // SAFETY: this thread is the container's only traverser.
        unsafe {
            ctx.container.traverse(&mut |node| {
                checks += 1;
                check_node(ctx, node, &mut live)
            });
        }
        Metrics::inc(&ctx.metrics.rounds);
        Metrics::add(&ctx.metrics.checks, checks);
        ctx.metrics.last_round_live.store(live, Ordering::Relaxed);

        match ctx.exit_phase() {
            ExitPhase::TransmitterDone => {
                // One more full pass over everything the transmitter drained.
                ctx.set_exit_phase(ExitPhase::MonitorBegin);
                continue;
            }
            ExitPhase::MonitorBegin => {
                ctx.set_exit_phase(ExitPhase::MonitorDone);
                return;
            }
            _ => {}
        }

        if let Some(pause) = ctx.config.round_sleep {
            std::thread::sleep(pause);
        }
    }
}

/// Verify one descriptor.
pub(crate) fn check_node(ctx: &Context, node: Descriptor, live: &mut u64) -> Verdict {
    for _ in 0..ctx.config.nop_spins {
        std::hint::spin_loop();
    }
    match ctx.config.mode {
        Mode::Lazy => check_lazy(ctx, node, live),
        Mode::Eager => check_eager(ctx, node, live),
    }
}

fn check_lazy(ctx: &Context, node: Descriptor, live: &mut u64) -> Verdict {
    // SAFETY: lazy buffers stay mapped until this function releases them.
    let capsule = unsafe { Capsule::from_user(node.user_addr as *mut u8) };

    let head = capsule.head();
    if head == ctx.canaries.realloc {
        return Verdict::Keep;
    }
    let ws = capsule.size();
    if capsule.head() != head {
        // A resize completed between the two head reads; the size word may
        // belong to either generation. Next round sees a settled buffer.
        return Verdict::Keep;
    }

    let expected_live = ctx.canaries.live_word(ws);
    let expected_freed = ctx.canaries.freed_word(ws);

    if head == expected_freed {
        if capsule.tail(ws) != expected_live {
            // Overflowed, then freed.
            ctx.raise_attack(AttackSite::Monitor, node.user_addr);
        }
        Metrics::inc(&ctx.metrics.delayed_frees);
        Metrics::add(&ctx.metrics.reclaimed_bytes, (ws * WORD_BYTES) as u64);
        // SAFETY: the owner freed this buffer; the monitor completes the
        // release exactly once, here.
        unsafe { ctx.host.dealloc(capsule.base_ptr()) };
        return Verdict::Remove;
    }
    if head != expected_live {
        ctx.raise_attack(AttackSite::Monitor, node.user_addr);
        return Verdict::Remove;
    }
    if capsule.tail(ws) != expected_live {
        ctx.raise_attack(AttackSite::Monitor, node.user_addr);
        return Verdict::Remove;
    }
    *live += 1;
    Verdict::Keep
}

fn check_eager(ctx: &Context, node: Descriptor, live: &mut u64) -> Verdict {
    // SAFETY: address arithmetic only; eager buffers are never dereferenced
    // directly by the monitor.
    let capsule = unsafe { Capsule::from_user(node.user_addr as *mut u8) };
    let pid = ctx.pid.load(Ordering::Relaxed);

    let Some(head) = read_word(pid, capsule.head_addr()) else {
        Metrics::inc(&ctx.metrics.vanished);
        return Verdict::Remove;
    };
    if head != node.id {
        // Freed (and possibly reallocated at the same address).
        return Verdict::Remove;
    }
    let Some(ws) = read_word(pid, capsule.size_addr()) else {
        Metrics::inc(&ctx.metrics.vanished);
        return Verdict::Remove;
    };
    let Some(tail) = read_word(pid, capsule.tail_addr(ws)) else {
        Metrics::inc(&ctx.metrics.vanished);
        return Verdict::Remove;
    };
    // Re-check the identity: a free between the first head read and the tail
    // read leaves the tail meaningless.
    let Some(head_again) = read_word(pid, capsule.head_addr()) else {
        Metrics::inc(&ctx.metrics.vanished);
        return Verdict::Remove;
    };
    if head_again != node.id {
        return Verdict::Remove;
    }
    if tail != ctx.canaries.live {
        ctx.raise_attack(AttackSite::Monitor, node.user_addr);
        return Verdict::Remove;
    }
    *live += 1;
    Verdict::Keep
}

/// Read one word of this process's memory as if from outside. A fault shows
/// up as a short or failed read, never as SIGSEGV.
fn read_word(pid: libc::pid_t, addr: usize) -> Option<usize> {
    let mut value: usize = 0;
    let local = libc::iovec {
        iov_base: (&raw mut value).cast(),
        iov_len: WORD_BYTES,
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: WORD_BYTES,
    };
    // SAFETY: the local iovec points at a stack word we own; the remote side
    // is validated by the kernel, which is the whole point.
    let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    (n == WORD_BYTES as isize).then_some(value)
}
