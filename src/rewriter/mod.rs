//! The Mach-O image rewriter.
//!
//! Turns one executable slice into a dylib: retypes the header, strips the
//! executable-only load commands, removes the chosen dependencies, and
//! recomputes the library ordinal namespace across the bind opcode streams
//! and the classic symbol table.
//!
//! # Rewrite Pipeline
//!
//! Each slice moves through the same phases, in order:
//!
//! 1. **Snapshot** - dependency list, per-slice ordinals, and each imported
//!    symbol's origin library, captured before any mutation
//! 2. **Header/Identity** - executable becomes dylib; signature, zero page,
//!    dynamic-linker, entry-point, and source-version commands go away; the
//!    identity command is added
//! 3. **Platform** - optional retarget to iOS or macOS 11.0
//! 4. **Removal** - explicit targets plus host-probe misses, and the orphaned
//!    symbol set they imply
//! 5. **Mutation** - removed dependency commands dropped, stub dependency
//!    added when anything was orphaned
//! 6. **Remap** - old-to-new ordinal map applied uniformly to every bind
//!    stream and the symbol table
//! 7. **Stub request** - the orphan set becomes a per-architecture build
//!    request for the driver

mod bind;
mod context;
mod ordinal;
mod symtab;

pub use context::{RewriteConfig, RewriteContext};
pub use ordinal::{is_sentinel_ordinal, library_ordinal, set_library_ordinal, OrdinalMap};

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::macho::*;
use crate::stub::StubRequest;

/// Version written into the identity and stub dylib commands.
const DYLIB_VERSION: u32 = 0x0001_0000;
/// Timestamp written into the identity and stub dylib commands.
const DYLIB_TIMESTAMP: u32 = 2;
/// Minimum OS and SDK version for retargeted platforms (11.0.0).
const RETARGET_VERSION: u32 = pack_version(11, 0, 0);

/// Platform retarget selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPlatform {
    /// iOS 11.0
    Ios,
    /// macOS 11.0
    Macos,
}

impl TargetPlatform {
    /// The LC_BUILD_VERSION platform identifier.
    pub fn platform_id(self) -> u32 {
        match self {
            TargetPlatform::Ios => PLATFORM_IOS,
            TargetPlatform::Macos => PLATFORM_MACOS,
        }
    }

    /// Human-readable platform name.
    pub fn name(self) -> &'static str {
        match self {
            TargetPlatform::Ios => "iOS",
            TargetPlatform::Macos => "macOS",
        }
    }
}

/// Validates the explicit removal list against the whole file.
///
/// A name must be a dependency of at least one slice; slices that lack it
/// treat the removal as a no-op.
pub fn validate_removals(file: &MachFile, remove_dylibs: &[String]) -> Result<()> {
    if remove_dylibs.is_empty() {
        return Ok(());
    }
    let mut known: BTreeSet<&str> = BTreeSet::new();
    for slice in file.slices() {
        known.extend(slice.image.dependency_names());
    }
    for name in remove_dylibs {
        if !known.contains(name.as_str()) {
            return Err(Error::RemoveTargetNotFound { name: name.clone() });
        }
    }
    Ok(())
}

/// Rewrites one slice in place.
///
/// Returns the stub build request when any imported symbol was orphaned by
/// dependency removal. The slice's command table is synced before returning;
/// any failure leaves serialization unreached.
pub fn rewrite_slice(image: &mut MachImage, config: &RewriteConfig) -> Result<Option<StubRequest>> {
    let mut ctx = RewriteContext::new(image, config);

    snapshot(&mut ctx)?;
    rewrite_header(&mut ctx)?;
    rewrite_platform(&mut ctx)?;
    compute_removals(&mut ctx)?;
    apply_removals(&mut ctx)?;
    remap_ordinals(&mut ctx)?;

    ctx.image.sync()?;
    Ok(stub_request(&ctx))
}

// =============================================================================
// Snapshot Phase
// =============================================================================

fn snapshot(ctx: &mut RewriteContext) -> Result<()> {
    for name in ctx.image.dependency_names() {
        ctx.orig_libs.push(name.to_string());
    }
    if ctx.orig_libs.len() > u8::MAX as usize {
        return Err(Error::parse(0, "more than 255 dependency dylib commands"));
    }
    for (index, name) in ctx.orig_libs.iter().enumerate() {
        ctx.orig_ordinals.insert(name.clone(), (index + 1) as u8);
    }

    // Symbol origins from the dyld-info streams.
    if let Some((_, dyld_info)) = ctx.image.dyld_info() {
        let streams = [
            (dyld_info.bind_off, dyld_info.bind_size, false),
            (dyld_info.weak_bind_off, dyld_info.weak_bind_size, false),
            (dyld_info.lazy_bind_off, dyld_info.lazy_bind_size, true),
        ];
        for (offset, size, lazy) in streams {
            if size == 0 {
                continue;
            }
            let data = ctx.image.read_at(offset as usize, size as usize)?.to_vec();
            for record in bind::parse_bind_records(&data, lazy)? {
                if record.ordinal >= 1 && record.ordinal <= ctx.orig_libs.len() as i64 {
                    let lib = ctx.orig_libs[record.ordinal as usize - 1].clone();
                    ctx.orig_sym_libs.insert(record.symbol, lib);
                }
            }
        }
    }

    // Symbol origins from the classic symbol table.
    for (name, ordinal) in symtab::undefined_imports(ctx.image)? {
        if !is_sentinel_ordinal(ordinal) && (ordinal as usize) <= ctx.orig_libs.len() {
            let lib = ctx.orig_libs[ordinal as usize - 1].clone();
            ctx.orig_sym_libs.entry(name).or_insert(lib);
        }
    }

    debug!(
        "{}: {} dependencies, {} bound symbols",
        ctx.arch_name(),
        ctx.orig_libs.len(),
        ctx.orig_sym_libs.len()
    );
    Ok(())
}

// =============================================================================
// Header / Identity Phase
// =============================================================================

fn rewrite_header(ctx: &mut RewriteContext) -> Result<()> {
    if ctx.image.header.filetype != MH_EXECUTE {
        return Err(Error::NotAnExecutable {
            filetype: ctx.image.header.filetype,
        });
    }

    info!("changing Mach-O type from executable to dylib");
    ctx.image.header.filetype = MH_DYLIB;
    info!("adding NO_REEXPORTED_DYLIBS flag");
    ctx.image.header.flags |= MachOFlags::NO_REEXPORTED_DYLIBS.bits();

    if let Some(index) = ctx.image.find_command(LC_CODE_SIGNATURE) {
        info!("removing code signature");
        let command = ctx.image.remove_command(index);
        if let Some(sig) = command.read_struct::<LinkeditDataCommand>() {
            // The signature blob is required to be the file tail; reclaim it.
            let end = sig.dataoff as u64 + sig.datasize as u64;
            if sig.dataoff > 0
                && (sig.dataoff as usize) < ctx.image.data.len()
                && end >= ctx.image.data.len() as u64
            {
                ctx.image.truncate_tail(sig.dataoff as u64)?;
            }
        }
    }

    if let Some(index) = ctx.image.segment_index(SEG_PAGEZERO) {
        info!("removing __PAGEZERO segment");
        ctx.image.remove_command(index);
    }

    info!("setting ID_DYLIB path to '{}'", ctx.config.new_id_path);
    ctx.image.commands.push(Command::dylib(
        LC_ID_DYLIB,
        &ctx.config.new_id_path,
        DYLIB_TIMESTAMP,
        DYLIB_VERSION,
        DYLIB_VERSION,
    ));

    if ctx.config.remove_info_plist && ctx.image.remove_section(SEG_TEXT, SECT_INFO_PLIST) {
        info!("removing __TEXT,__info_plist");
    }

    if let Some(index) = ctx.image.find_command(LC_LOAD_DYLINKER) {
        info!("removing dynamic linker command");
        ctx.image.remove_command(index);
    }

    if let Some(index) = ctx.image.find_command(LC_MAIN) {
        info!("removing MAIN command");
        ctx.image.remove_command(index);
    }

    if let Some(index) = ctx.image.find_command(LC_SOURCE_VERSION) {
        info!("removing source version command");
        ctx.image.remove_command(index);
    }

    Ok(())
}

// =============================================================================
// Platform Phase
// =============================================================================

fn rewrite_platform(ctx: &mut RewriteContext) -> Result<()> {
    let Some(platform) = ctx.config.platform else {
        return Ok(());
    };

    for cmd_type in [
        LC_VERSION_MIN_MACOSX,
        LC_VERSION_MIN_IPHONEOS,
        LC_VERSION_MIN_TVOS,
        LC_VERSION_MIN_WATCHOS,
    ] {
        while let Some(index) = ctx.image.find_command(cmd_type) {
            let command = ctx.image.remove_command(index);
            if let Some(minver) = command.read_struct::<VersionMinCommand>() {
                let (vx, vy, vz) = unpack_version(minver.version);
                let (sx, sy, sz) = unpack_version(minver.sdk);
                info!(
                    "removing old VERSION_MIN command (version: '{}.{}.{}' SDK: '{}.{}.{}')",
                    vx, vy, vz, sx, sy, sz
                );
            }
        }
    }

    while let Some(index) = ctx.image.find_command(LC_BUILD_VERSION) {
        let command = ctx.image.remove_command(index);
        if let Some(buildver) = command.read_struct::<BuildVersionCommand>() {
            let (vx, vy, vz) = unpack_version(buildver.minos);
            info!(
                "removing old BUILD_VERSION command (platform: {} version: '{}.{}.{}')",
                buildver.platform, vx, vy, vz
            );
        }
    }

    info!(
        "adding new BUILD_VERSION command (platform: '{}' version: '11.0.0' SDK: '11.0.0')",
        platform.name()
    );
    ctx.image.commands.push(Command::build_version(
        platform.platform_id(),
        RETARGET_VERSION,
        RETARGET_VERSION,
    ));

    Ok(())
}

// =============================================================================
// Removal Set Computation
// =============================================================================

fn compute_removals(ctx: &mut RewriteContext) -> Result<()> {
    for name in &ctx.config.remove_dylibs {
        if ctx.orig_ordinals.contains_key(name) {
            ctx.removal_set.insert(name.clone());
        } else {
            // Validated against the whole file by the driver; a fat slice
            // may legitimately lack the target.
            debug!(
                "{}: removal target '{}' not present in this slice",
                ctx.arch_name(),
                name
            );
        }
    }

    if ctx.config.auto_remove_dylibs {
        for name in &ctx.orig_libs {
            if !(ctx.config.probe)(name) {
                info!("marking unavailable dylib '{}' for removal", name);
                ctx.removal_set.insert(name.clone());
            }
        }
    }

    for (symbol, lib) in &ctx.orig_sym_libs {
        if ctx.removal_set.contains(lib) {
            info!("marking symbol '{}' from dylib '{}' for stubbing", symbol, lib);
            ctx.orphaned_symbols.insert(symbol.clone());
        }
    }

    Ok(())
}

// =============================================================================
// Mutation Phase
// =============================================================================

fn apply_removals(ctx: &mut RewriteContext) -> Result<()> {
    for name in &ctx.removal_set {
        let index = ctx
            .image
            .commands
            .iter()
            .position(|c| c.is_dependency_dylib() && c.dylib_name() == Some(name.as_str()));
        if let Some(index) = index {
            info!(
                "removing dependent dylib '{}' (ordinal {})",
                name, ctx.orig_ordinals[name]
            );
            ctx.image.remove_command(index);
        }
    }

    if !ctx.orphaned_symbols.is_empty() {
        info!(
            "creating stub library import '{}'",
            ctx.config.stub_install_path
        );
        ctx.image.commands.push(Command::dylib(
            LC_LOAD_DYLIB,
            &ctx.config.stub_install_path,
            DYLIB_TIMESTAMP,
            DYLIB_VERSION,
            DYLIB_VERSION,
        ));
    }

    Ok(())
}

// =============================================================================
// Ordinal Remap Phase
// =============================================================================

fn remap_ordinals(ctx: &mut RewriteContext) -> Result<()> {
    let new_ordinals: HashMap<String, u8> = ctx
        .image
        .dependency_names()
        .enumerate()
        .map(|(index, name)| (name.to_string(), (index + 1) as u8))
        .collect();

    let mut map = OrdinalMap::default();
    for (name, &old) in &ctx.orig_ordinals {
        if let Some(&new) = new_ordinals.get(name) {
            map.insert(old, new);
        } else if let Some(&stub) = new_ordinals.get(&ctx.config.stub_install_path) {
            map.insert(old, stub);
        }
        // A removed dependency with no stub stays unmapped; any surviving
        // reference to it trips the invariant in remap().
    }

    remap_bind_streams(ctx, &map)?;

    info!("updating library ordinals in symtab");
    let remapped = symtab::remap_import_ordinals(ctx.image, &map)?;
    debug!("{}: remapped {} symtab entries", ctx.arch_name(), remapped);

    Ok(())
}

fn remap_bind_streams(ctx: &mut RewriteContext, map: &OrdinalMap) -> Result<()> {
    let Some((command_index, mut dyld_info)) = ctx.image.dyld_info() else {
        return Ok(());
    };

    info!("updating library ordinals in binding info");
    let mut command_dirty = false;

    let streams = [
        (dyld_info.bind_off, dyld_info.bind_size, false),
        (dyld_info.weak_bind_off, dyld_info.weak_bind_size, false),
        (dyld_info.lazy_bind_off, dyld_info.lazy_bind_size, true),
    ];

    for (stream_index, (offset, size, lazy)) in streams.into_iter().enumerate() {
        if size == 0 {
            continue;
        }
        let data = ctx.image.read_at(offset as usize, size as usize)?.to_vec();
        let mut remapped = bind::remap_stream(&data, map, lazy)?;
        if remapped == data {
            continue;
        }

        if remapped.len() <= data.len() {
            // Pad to the original width with DONE bytes and patch in place.
            remapped.resize(data.len(), BIND_OPCODE_DONE);
            ctx.image.write_at(offset as usize, &remapped)?;
            continue;
        }

        // The stream grew (an immediate ordinal now needs a ULEB); move it
        // to the end of __LINKEDIT and repoint the command.
        let new_offset = ctx.image.append_to_linkedit(&remapped)?;
        let new_offset = u32::try_from(new_offset)
            .map_err(|_| Error::parse(0, "relocated bind stream beyond 4 GiB"))?;
        match stream_index {
            0 => {
                dyld_info.bind_off = new_offset;
                dyld_info.bind_size = remapped.len() as u32;
            }
            1 => {
                dyld_info.weak_bind_off = new_offset;
                dyld_info.weak_bind_size = remapped.len() as u32;
            }
            _ => {
                dyld_info.lazy_bind_off = new_offset;
                dyld_info.lazy_bind_size = remapped.len() as u32;
            }
        }
        command_dirty = true;
    }

    if command_dirty {
        ctx.image.commands[command_index].write_struct(&dyld_info);
    }

    Ok(())
}

// =============================================================================
// Stub Trigger Phase
// =============================================================================

fn stub_request(ctx: &RewriteContext) -> Option<StubRequest> {
    if ctx.orphaned_symbols.is_empty() {
        return None;
    }
    info!(
        "{}: stub will export {} symbols",
        ctx.arch_name(),
        ctx.orphaned_symbols.len()
    );
    Some(StubRequest {
        cputype: ctx.image.header.cputype,
        symbols: ctx.orphaned_symbols.clone(),
    })
}

// =============================================================================
// Tests
// =============================================================================
