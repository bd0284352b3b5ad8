//! Runtime configuration.
//!
//! All knobs are read from the environment once at startup:
//! - `CRUISER_MODE`: `lazy` (default) or `eager` verification mode.
//! - `CRUISER_SLEEP`: integer milliseconds the monitor sleeps between rounds
//!   (default: no sleep). Clamped below one second.
//! - `CRUISER_NOP`: busy-loop iterations inserted into each per-buffer check,
//!   for throughput experiments (default 0).
//! - `CRUISER_ON_ATTACK`: `abort` (default), `exit`, or `continue`.
//! - `CRUISER_DUPFREE`: `1`/`on` enables the duplicate-free check.
//!
//! Tests construct a [`Config`] directly instead of going through the
//! environment.

use std::time::Duration;

/// Verification mode.
///
/// The mode decides who returns a freed buffer to the host allocator and,
/// consequently, what the head word holds (see `canary`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// `free` only flags the head word; the monitor performs the tail check
    /// and the actual release. Freed memory is never reused before one more
    /// verification pass, so the monitor can dereference it safely.
    #[default]
    Lazy,
    /// `free` validates the tail and releases the buffer immediately. The
    /// monitor identifies buffers by a per-allocation id word and must
    /// tolerate reading regions already returned to the OS.
    Eager,
}

impl Mode {
    /// Parse from string (case-insensitive, loose).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "eager" | "immediate" => Self::Eager,
            _ => Self::Lazy,
        }
    }

    /// Read `CRUISER_MODE` through `getenv` without allocating. Used by the
    /// loader-bootstrap allocation path, which runs while the interceptor is
    /// still initializing and must not enter the Rust allocator.
    #[must_use]
    pub fn from_raw_env() -> Self {
        // SAFETY: getenv returns either null or a NUL-terminated string that
        // stays valid for the duration of this call.
        let p = unsafe { libc::getenv(c"CRUISER_MODE".as_ptr()) };
        if p.is_null() {
            return Self::Lazy;
        }
        let value = unsafe { std::ffi::CStr::from_ptr(p) }.to_bytes();
        if value.eq_ignore_ascii_case(b"eager") || value.eq_ignore_ascii_case(b"immediate") {
            Self::Eager
        } else {
            Self::Lazy
        }
    }
}

/// What to do when a corrupted buffer is found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackResponse {
    /// Raise SIGABRT after the diagnostic. Default.
    #[default]
    Abort,
    /// `exit(-1)` after the diagnostic.
    Exit,
    /// Report and keep running.
    Continue,
}

impl AttackResponse {
    /// Parse from string (case-insensitive, loose).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "exit" => Self::Exit,
            "continue" | "goon" | "log" => Self::Continue,
            _ => Self::Abort,
        }
    }
}

/// Monitor sleeps are capped below one second so a misconfigured interval
/// cannot stall the exit drain.
pub const MAX_ROUND_SLEEP_MS: u64 = 999;

/// Process-wide configuration, fixed at context creation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verification mode.
    pub mode: Mode,
    /// Monitor inter-round sleep. `None` means back-to-back rounds.
    pub round_sleep: Option<Duration>,
    /// Busy-loop iterations per descriptor check.
    pub nop_spins: u32,
    /// Response to a detected attack.
    pub on_attack: AttackResponse,
    /// Whether `free` checks for duplicate frees before flagging.
    pub check_duplicate_free: bool,
    /// Capacity of the first descriptor ring of each mutator thread.
    pub initial_ring_capacity: usize,
    /// Capacity of the list-node recycling ring.
    pub recycle_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Lazy,
            round_sleep: None,
            nop_spins: 0,
            on_attack: AttackResponse::Abort,
            check_duplicate_free: false,
            initial_ring_capacity: crate::thread_record::INITIAL_RING_CAPACITY,
            recycle_capacity: crate::list::LIST_RING_SIZE,
        }
    }
}

impl Config {
    /// Build the configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("CRUISER_MODE") {
            cfg.mode = Mode::from_str_loose(&v);
        }
        if let Ok(v) = std::env::var("CRUISER_SLEEP")
            && let Ok(ms) = v.trim().parse::<u64>()
        {
            cfg.round_sleep = Some(Duration::from_millis(ms.min(MAX_ROUND_SLEEP_MS)));
        }
        if let Ok(v) = std::env::var("CRUISER_NOP")
            && let Ok(n) = v.trim().parse::<u32>()
        {
            cfg.nop_spins = n;
        }
        if let Ok(v) = std::env::var("CRUISER_ON_ATTACK") {
            cfg.on_attack = AttackResponse::from_str_loose(&v);
        }
        if let Ok(v) = std::env::var("CRUISER_DUPFREE") {
            cfg.check_duplicate_free =
                matches!(v.to_ascii_lowercase().as_str(), "1" | "on" | "true" | "yes");
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!(Mode::from_str_loose("lazy"), Mode::Lazy);
        assert_eq!(Mode::from_str_loose("EAGER"), Mode::Eager);
        assert_eq!(Mode::from_str_loose("immediate"), Mode::Eager);
        assert_eq!(Mode::from_str_loose("bogus"), Mode::Lazy);
    }

    #[test]
    fn parse_attack_responses() {
        assert_eq!(AttackResponse::from_str_loose("abort"), AttackResponse::Abort);
        assert_eq!(AttackResponse::from_str_loose("EXIT"), AttackResponse::Exit);
        assert_eq!(
            AttackResponse::from_str_loose("continue"),
            AttackResponse::Continue
        );
        assert_eq!(AttackResponse::from_str_loose("?"), AttackResponse::Abort);
    }

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.mode, Mode::Lazy);
        assert_eq!(cfg.on_attack, AttackResponse::Abort);
        assert!(cfg.round_sleep.is_none());
        assert_eq!(cfg.nop_spins, 0);
        assert!(!cfg.check_duplicate_free);
        assert_eq!(cfg.initial_ring_capacity, 1024);
    }
}
