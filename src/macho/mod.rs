//! Mach-O file format handling.
//!
//! This module provides types and utilities for parsing and modifying Mach-O
//! files: thin and universal containers, the load-command table, segments and
//! sections, and the symbol-table and dyld-info commands the rewriter edits.

mod constants;
mod fat;
mod image;
mod structs;

#[cfg(test)]
pub(crate) mod testutil;

pub use constants::*;
pub use fat::*;
pub use image::*;
pub use structs::*;
