//! C ABI surface of the cruiser heap monitor.
//!
//! Built as a `cdylib` and loaded with `LD_PRELOAD`, this crate shadows the
//! four allocator symbols and forwards them to `cruiser-core`. A constructor
//! in `.init_array` initializes the core as soon as the object is mapped;
//! the first hooked call still initializes synchronously if the constructor
//! has not fired yet (statically linked targets do not run it — see the
//! interceptor's bootstrap path), so nothing here depends on loader hooks
//! that may never fire.
//!
//! Do not link this crate into a test binary: shadowing the test runner's
//! own allocator would recurse through the interceptor. Tests drive the
//! equivalent `Context` methods in `cruiser-core` directly.

mod malloc_abi;

/// Initialize the core when the dynamic loader maps this object.
#[unsafe(link_section = ".init_array")]
#[used]
static INIT_ON_LOAD: extern "C" fn() = {
    extern "C" fn cruiser_init_on_load() {
        cruiser_core::context::initialize();
    }
    cruiser_init_on_load
};
