//! Threading backends
//!
//! One backend per target, selected at compile time. Everything above this
//! module is generic over `ThreadingFactory` and names the platform choice
//! only through `PlatformThreadingFactory`.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod pthreads;
        pub use pthreads::{
            PthreadsConditionVariable, PthreadsMutex, PthreadsThread, PthreadsThreadingFactory,
        };
        pub use pthreads::PthreadsThreadingFactory as PlatformThreadingFactory;
    }
}
