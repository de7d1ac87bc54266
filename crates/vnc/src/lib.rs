#![forbid(unsafe_code)]
//! Vnode cache public API facade.
//!
//! Re-exports the engine from `vnc-core` through a stable external
//! interface. Filesystems embedding the cache depend on this crate.

pub use vnc_core::*;
