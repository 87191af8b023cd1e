//! dylibify - convert Mach-O executables into loadable dylibs.
//!
//! This library rewrites a Mach-O executable image (thin or universal) into a
//! dylib that another process can load at runtime. Dependencies the target
//! host is missing can be removed, with every orphaned import retargeted at a
//! generated stub dylib that defines placeholder implementations.
//!
//! # Pipeline
//!
//! 1. Parse the input (fat containers are processed slice by slice)
//! 2. Rewrite each slice: header, load commands, ordinal namespace
//! 3. Build and fat-pack the stub dylib if any symbols were orphaned
//! 4. Serialize the rewritten image - only after every step succeeded
//!
//! # Example
//!
//! ```no_run
//! use dylibify::{dylibify, DylibifyOptions};
//!
//! fn main() -> dylibify::Result<()> {
//!     let mut options = DylibifyOptions::new("target/app", "out/app.dylib");
//!     options.auto_remove_dylibs = true;
//!     dylibify(&options)
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod macho;
pub mod rewriter;
pub mod stub;
pub mod util;

pub use error::{Error, Result};
pub use rewriter::{RewriteConfig, TargetPlatform};
pub use stub::StubRequest;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::info;

use macho::MachFile;
use stub::{build_fat_stub, dylib_exists, STUB_FILE_NAME};

/// Options for one conversion.
#[derive(Debug, Clone)]
pub struct DylibifyOptions {
    /// Input Mach-O executable
    pub input: PathBuf,
    /// Output Mach-O dylib
    pub output: PathBuf,
    /// Value for the identity-dylib command; defaults to
    /// `@executable_path/<basename(output)>`
    pub dylib_path: Option<String>,
    /// Dependencies to remove unconditionally
    pub remove_dylibs: Vec<String>,
    /// Also remove dependencies the host loader cannot resolve
    pub auto_remove_dylibs: bool,
    /// Drop the embedded `__TEXT,__info_plist` section
    pub remove_info_plist: bool,
    /// Retarget the platform metadata to iOS or macOS 11.0
    pub platform: Option<TargetPlatform>,
}

impl DylibifyOptions {
    /// Creates options for converting `input` into `output` with no removals.
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            dylib_path: None,
            remove_dylibs: Vec::new(),
            auto_remove_dylibs: false,
            remove_info_plist: false,
            platform: None,
        }
    }
}

/// Converts a Mach-O executable into a dylib.
///
/// No partial output: the destination file is written only after every slice
/// rewrote cleanly and every requested stub built.
pub fn dylibify(options: &DylibifyOptions) -> Result<()> {
    let file = File::open(&options.input).map_err(|e| Error::FileOpen {
        path: options.input.clone(),
        source: e,
    })?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: options.input.clone(),
        source: e,
    })?;

    let mut mach = MachFile::parse(&mmap)?;

    let new_id_path = match &options.dylib_path {
        Some(path) => path.clone(),
        None => default_id_path(&options.output),
    };
    let stub_install_path = sibling_path(&new_id_path, STUB_FILE_NAME);

    rewriter::validate_removals(&mach, &options.remove_dylibs)?;

    let config = RewriteConfig {
        new_id_path,
        stub_install_path,
        remove_dylibs: options.remove_dylibs.clone(),
        auto_remove_dylibs: options.auto_remove_dylibs,
        remove_info_plist: options.remove_info_plist,
        platform: options.platform,
        probe: dylib_exists,
    };

    let mut stub_requests = Vec::new();
    for slice in mach.slices_mut() {
        info!("rewriting {} slice", slice.image.header.arch_name());
        if let Some(request) = rewriter::rewrite_slice(&mut slice.image, &config)? {
            stub_requests.push(request);
        }
    }

    if !stub_requests.is_empty() {
        let out_dir = options
            .output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        build_fat_stub(&stub_requests, out_dir, &config.stub_install_path)?;
    }

    let bytes = mach.into_bytes()?;
    if let Some(parent) = options.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }
    fs::write(&options.output, &bytes).map_err(|e| Error::FileWrite {
        path: options.output.clone(),
        source: e,
    })?;

    info!(
        "wrote {} ({} bytes)",
        options.output.display(),
        bytes.len()
    );
    Ok(())
}

/// Default identity path: `@executable_path/<basename(output)>`.
fn default_id_path(output: &Path) -> String {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.dylib".to_string());
    format!("@executable_path/{name}")
}

/// Replaces the last path component, keeping loader-relative prefixes like
/// `@executable_path` intact.
fn sibling_path(path: &str, file_name: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/{file_name}"),
        None => file_name.to_string(),
    }
}
