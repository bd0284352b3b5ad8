//! Concurrent heap buffer-overflow monitoring.
//!
//! Every intercepted allocation is enlarged by three words and wrapped with
//! integrity-verifying sentinels: a head word, a size word, and a tail word
//! adjacent to the user payload. A background *monitor* thread re-checks every
//! outstanding buffer for tampering while mutator threads keep running at
//! (almost) full speed: the only mutator-side cost is writing the sentinels
//! and pushing a small descriptor into a per-thread lock-free ring.
//!
//! # Architecture
//!
//! - **Canary protocol** (`canary`): per-buffer word layout and the process
//!   canary constants.
//! - **Descriptor transport** (`ring`, `thread_record`): one single-producer /
//!   single-consumer ring chain per mutator thread, drained by a dedicated
//!   *transmitter* thread.
//! - **Descriptor container** (`list`, `recycle`): a singly linked list with
//!   single-writer insertion (transmitter) and single-walker traversal
//!   (monitor), backed by a bounded node-recycling ring.
//! - **Interception** (`interceptor`, `host`): wrappers around the host
//!   allocator's `malloc`/`free`/`realloc`/`calloc`, resolved at startup via
//!   the dynamic loader.
//! - **Verification** (`monitor`, `transmitter`): the two background threads
//!   and the lazy/eager per-buffer check protocols.
//! - **Lifecycle** (`context`): one process-wide context holding all shared
//!   state, the init latch, fork detection, and the three-phase exit drain.
//!
//! The crate is a library so the whole pipeline can be driven by tests without
//! shadowing the test binary's own allocator; the C ABI entry points live in
//! `cruiser-abi`.

pub mod canary;
pub mod config;
pub mod context;
pub mod host;
pub mod interceptor;
pub mod list;
pub mod metrics;
pub mod monitor;
pub mod recycle;
pub mod report;
pub mod ring;
pub mod thread_record;
pub mod transmitter;

pub use canary::{CanarySet, EXTRA_WORDS, WORD_BYTES, word_size};
pub use config::{AttackResponse, Config, Mode};
pub use context::Context;
pub use metrics::{Metrics, MetricsSnapshot};
pub use ring::Descriptor;
