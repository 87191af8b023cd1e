//! Stub dylib compilation and universal packaging.
//!
//! One thin stub per requesting slice architecture, compiled with the host
//! `clang`, then fused with `lipo` into a single universal stub placed beside
//! the rewriter's output. Scratch files (generated sources and thin dylibs)
//! are left in the output directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use rayon::prelude::*;
use tracing::info;

use crate::error::{Error, Result};
use crate::macho::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64};

use super::source::generate_stub_source;

/// File name of the universal stub, referenced by the rewritten load
/// commands.
pub const STUB_FILE_NAME: &str = "dylibify-stubs.dylib";

/// A per-slice request to build a thin stub.
#[derive(Debug, Clone)]
pub struct StubRequest {
    /// CPU type of the requesting slice
    pub cputype: u32,
    /// Symbols the stub must export
    pub symbols: BTreeSet<String>,
}

/// Maps a Mach-O CPU type to the matching `clang -arch` name.
pub fn clang_arch(cputype: u32) -> Result<&'static str> {
    match cputype {
        CPU_TYPE_X86 => Ok("i386"),
        CPU_TYPE_X86_64 => Ok("x86_64"),
        CPU_TYPE_ARM => Ok("armv7"),
        CPU_TYPE_ARM64 => Ok("arm64"),
        other => Err(Error::UnsupportedStubArch { cputype: other }),
    }
}

/// Builds every requested thin stub, then fat-packs them.
///
/// Thin compiles run in parallel; the `lipo` step joins all of them. Returns
/// the path of the universal stub.
pub fn build_fat_stub(
    requests: &[StubRequest],
    out_dir: &Path,
    install_path: &str,
) -> Result<PathBuf> {
    let thin_paths: Vec<PathBuf> = requests
        .par_iter()
        .map(|request| build_thin_stub(request, out_dir, install_path))
        .collect::<Result<_>>()?;

    let fat_path = out_dir.join(STUB_FILE_NAME);
    info!("generating fat stub dylib at '{}'", fat_path.display());

    let mut lipo = Command::new("lipo");
    lipo.arg("-create").arg("-output").arg(&fat_path);
    for thin in &thin_paths {
        lipo.arg(thin);
    }
    run_tool("lipo", lipo)?;

    Ok(fat_path)
}

/// Compiles one thin stub for the request's architecture.
fn build_thin_stub(
    request: &StubRequest,
    out_dir: &Path,
    install_path: &str,
) -> Result<PathBuf> {
    let arch = clang_arch(request.cputype)?;
    let source = generate_stub_source(&request.symbols)?;

    let source_path = out_dir.join(format!("dylibify-stubs.{arch}.m"));
    let thin_path = out_dir.join(format!("dylibify-stubs.{arch}.dylib"));

    fs::write(&source_path, source).map_err(|e| Error::FileWrite {
        path: source_path.clone(),
        source: e,
    })?;

    info!(
        "codegening and building stub dylib for arch {} '{}'",
        arch,
        thin_path.display()
    );

    let mut clang = Command::new("clang");
    clang
        .arg("-arch")
        .arg(arch)
        .arg("-o")
        .arg(&thin_path)
        .arg(&source_path)
        .arg("-shared")
        .arg("-fobjc-arc")
        .arg("-framework")
        .arg("Foundation")
        .arg(format!("-Wl,-install_name,{install_path}"));
    run_tool("clang", clang)?;

    Ok(thin_path)
}

/// Runs an external tool, inheriting stdio, and maps its failure modes.
fn run_tool(tool: &'static str, mut command: Command) -> Result<()> {
    let status = command
        .status()
        .map_err(|source| Error::ToolchainSpawn { tool, source })?;
    if !status.success() {
        return Err(Error::ToolchainExit {
            tool,
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clang_arch_mapping() {
        assert_eq!(clang_arch(CPU_TYPE_X86).unwrap(), "i386");
        assert_eq!(clang_arch(CPU_TYPE_X86_64).unwrap(), "x86_64");
        assert_eq!(clang_arch(CPU_TYPE_ARM).unwrap(), "armv7");
        assert_eq!(clang_arch(CPU_TYPE_ARM64).unwrap(), "arm64");
        assert!(matches!(
            clang_arch(0x2A),
            Err(Error::UnsupportedStubArch { cputype: 0x2A })
        ));
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let command = Command::new("dylibify-no-such-tool-xyz");
        assert!(matches!(
            run_tool("clang", command),
            Err(Error::ToolchainSpawn { tool: "clang", .. })
        ));
    }
}
