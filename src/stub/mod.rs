//! Stub dylib synthesis.
//!
//! When the rewriter removes a dependency that still owns imported symbols,
//! those orphans are collapsed into one generated stub dylib. This module
//! covers the three pieces of that pipeline: the host probe that drives
//! auto-removal, the Objective-C source generator, and the clang/lipo build
//! driver.

mod builder;
mod probe;
mod source;

pub use builder::{build_fat_stub, clang_arch, StubRequest, STUB_FILE_NAME};
pub use probe::dylib_exists;
pub use source::{generate_stub_source, OBJC_CLASS_PREFIX};
