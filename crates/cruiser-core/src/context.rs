//! The process-wide context and its lifecycle.
//!
//! All shared state lives in one [`Context`]: configuration, canary set,
//! host allocator, thread records, the descriptor container, and the exit
//! state machine. The C ABI reaches it through a manual latch
//! (`AtomicU8` state + `AtomicPtr` handle) rather than `OnceLock`: under
//! LD_PRELOAD the initializer itself allocates, so the latch must answer
//! re-entrant lookups from the initializing thread with "not yet" instead of
//! blocking on itself. Tests bypass the latch entirely and build independent
//! leaked contexts.
//!
//! Shutdown is a three-phase handoff. The atexit handler flags
//! `ExitHooked`; the transmitter acknowledges with `TransmitterBegin`, runs
//! one more full sweep, and posts `TransmitterDone`; the monitor mirrors
//! this with `MonitorBegin`/`MonitorDone`. The handler busy-waits for
//! `MonitorDone` with a one-second cap so a wedged thread cannot hang exit.
//! The extra full pass on each side guarantees at least one verification
//! round sees every descriptor drained after shutdown began.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::canary::{ALL_ONES, CanarySet, publish_process_canaries};
use crate::config::Config;
use crate::host::HostAllocator;
use crate::interceptor::unprotected;
use crate::list::DescriptorList;
use crate::metrics::Metrics;
use crate::monitor::monitor_loop;
use crate::report;
use crate::thread_record::ThreadRecordList;

/// The at-exit drain never waits longer than this.
pub const EXIT_WAIT_CAP: Duration = Duration::from_secs(1);

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitPhase {
    Running = 0,
    ExitHooked = 1,
    TransmitterBegin = 2,
    TransmitterDone = 3,
    MonitorBegin = 4,
    MonitorDone = 5,
}

impl ExitPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::ExitHooked,
            2 => Self::TransmitterBegin,
            3 => Self::TransmitterDone,
            4 => Self::MonitorBegin,
            5 => Self::MonitorDone,
            _ => Self::Running,
        }
    }
}

/// Process-wide state. One per process in production; one per test fixture.
pub struct Context {
    pub(crate) config: Config,
    pub(crate) canaries: CanarySet,
    pub(crate) host: HostAllocator,
    pub(crate) records: ThreadRecordList,
    pub(crate) container: DescriptorList,
    /// Eager-mode identity counter; 0 is reserved for "freed".
    next_id: AtomicUsize,
    exit_phase: AtomicU8,
    pub(crate) pid: AtomicI32,
    ready: AtomicBool,
    pub(crate) metrics: Metrics,
    started_at: Instant,
}

impl Context {
    /// Build a context: resolve the host allocator, draw canaries, set up the
    /// transport structures. Threads are not spawned yet; see [`start`].
    ///
    /// The context is leaked: monitor and transmitter hold `'static`
    /// references, and records/containers are designed to never be unlinked.
    ///
    /// [`start`]: Self::start
    pub fn new(config: Config) -> Result<&'static Self, &'static str> {
        let host = HostAllocator::resolve()?;
        let canaries = publish_process_canaries(CanarySet::generate());
        let recycle = config.recycle_capacity;
        let ctx = Box::leak(Box::new(Self {
            config,
            canaries,
            host,
            records: ThreadRecordList::new(),
            container: DescriptorList::new(recycle),
            next_id: AtomicUsize::new(0),
            exit_phase: AtomicU8::new(ExitPhase::Running as u8),
            // SAFETY: getpid is always safe.
            pid: AtomicI32::new(unsafe { libc::getpid() }),
            ready: AtomicBool::new(false),
            metrics: Metrics::new(),
            started_at: Instant::now(),
        }));
        Ok(ctx)
    }

    /// Spawn the monitor thread (which spawns the transmitter).
    pub fn start(&'static self) {
        let _guard = unprotected();
        let ctx = self;
        if std::thread::Builder::new()
            .name("cruiser-monitor".into())
            .spawn(move || monitor_loop(ctx))
            .is_err()
        {
            report::fatal_thread_spawn("monitor");
        }
    }

    /// Allow the background threads to begin real work.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether init has finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Convenience for tests: spawn threads and mark ready.
    pub fn activate(&'static self) {
        self.start();
        self.mark_ready();
    }

    /// Current shutdown phase.
    #[must_use]
    pub fn exit_phase(&self) -> ExitPhase {
        ExitPhase::from_u8(self.exit_phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_exit_phase(&self, phase: ExitPhase) {
        self.exit_phase.store(phase as u8, Ordering::SeqCst);
    }

    /// A fresh eager-mode identity: monotonic, never 0.
    pub(crate) fn fresh_id(&self) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id == 0 { ALL_ONES } else { id }
    }

    /// The per-context counters.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The canary constants (fixed for the context's lifetime).
    #[must_use]
    pub fn canaries(&self) -> &CanarySet {
        &self.canaries
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Time since the context was built.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn raise_attack(&self, site: report::AttackSite, user_addr: usize) {
        Metrics::inc(&self.metrics.attacks);
        report::attack(self.config.on_attack, site, user_addr);
    }

    /// Run the three-phase drain: flag the shutdown, then wait (bounded) for
    /// the monitor's final pass. Idempotent; only the first call does work.
    pub fn begin_shutdown(&self) {
        if self
            .exit_phase
            .compare_exchange(
                ExitPhase::Running as u8,
                ExitPhase::ExitHooked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let begun = Instant::now();
        while self.exit_phase() != ExitPhase::MonitorDone && begun.elapsed() < EXIT_WAIT_CAP {
            std::thread::yield_now();
        }
    }
}

// --- global latch ----------------------------------------------------------

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static GLOBAL: AtomicPtr<Context> = AtomicPtr::new(std::ptr::null_mut());
static INIT_THREAD: AtomicUsize = AtomicUsize::new(0);

fn self_thread() -> usize {
    // SAFETY: pthread_self is always safe.
    unsafe { libc::pthread_self() as usize }
}

/// The global context, if init has completed.
#[must_use]
pub fn try_global() -> Option<&'static Context> {
    if STATE.load(Ordering::Acquire) == STATE_READY {
        let p = GLOBAL.load(Ordering::Acquire);
        // SAFETY: published once, never torn down.
        return Some(unsafe { &*p });
    }
    None
}

/// The global context, initializing it if this call is first.
///
/// Returns `None` only for re-entrant calls from the thread that is
/// currently initializing (e.g. `dlsym` calling back into `calloc`); the
/// caller then serves the request from the bootstrap path. Other threads
/// arriving mid-init spin until the context is published.
pub fn global_or_init() -> Option<&'static Context> {
    loop {
        match STATE.load(Ordering::Acquire) {
            STATE_READY => return try_global(),
            STATE_INITIALIZING => {
                if INIT_THREAD.load(Ordering::Relaxed) == self_thread() {
                    return None;
                }
                std::hint::spin_loop();
            }
            _ => {
                if STATE
                    .compare_exchange(
                        STATE_UNINIT,
                        STATE_INITIALIZING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    INIT_THREAD.store(self_thread(), Ordering::Relaxed);
                    return Some(run_global_init());
                }
            }
        }
    }
}

/// Idempotent entry point for the loader constructor.
pub fn initialize() {
    let _ = global_or_init();
}

fn run_global_init() -> &'static Context {
    let ctx = match Context::new(Config::from_env()) {
        Ok(ctx) => ctx,
        Err(symbol) => report::fatal_unresolved(symbol),
    };
    GLOBAL.store(ctx as *const Context as *mut Context, Ordering::Release);
    ctx.start();
    // SAFETY: registering a plain extern "C" callback.
    if unsafe { libc::atexit(global_exit_drain) } != 0 {
        report::warn("atexit registration failed; no final drain at exit");
    }
    STATE.store(STATE_READY, Ordering::Release);
    ctx.mark_ready();
    ctx
}

extern "C" fn global_exit_drain() {
    if let Some(ctx) = try_global() {
        ctx.begin_shutdown();
    }
}
