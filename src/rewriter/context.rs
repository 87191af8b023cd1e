//! Rewrite context: per-slice state and caller intent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::macho::MachImage;

use super::TargetPlatform;

/// Caller intent, shared by every slice of one rewrite.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Path written into the `LC_ID_DYLIB` command
    pub new_id_path: String,
    /// Path written into the stub's load command (and its install name)
    pub stub_install_path: String,
    /// Explicit removal list (validated against the whole file by the driver)
    pub remove_dylibs: Vec<String>,
    /// Also remove every dependency the host loader cannot resolve
    pub auto_remove_dylibs: bool,
    /// Drop the `__TEXT,__info_plist` section
    pub remove_info_plist: bool,
    /// Retarget the platform metadata
    pub platform: Option<TargetPlatform>,
    /// Host probe consulted by auto-removal
    pub probe: fn(&str) -> bool,
}

impl RewriteConfig {
    /// Creates a config with the given identity path and defaults otherwise.
    pub fn new(new_id_path: impl Into<String>, stub_install_path: impl Into<String>) -> Self {
        Self {
            new_id_path: new_id_path.into(),
            stub_install_path: stub_install_path.into(),
            remove_dylibs: Vec::new(),
            auto_remove_dylibs: false,
            remove_info_plist: false,
            platform: None,
            probe: crate::stub::dylib_exists,
        }
    }
}

/// Per-slice rewrite state.
///
/// The snapshot fields are filled before any mutation and describe the slice
/// as it arrived; the removal and orphan sets are derived from them.
#[derive(Debug)]
pub struct RewriteContext<'a> {
    /// The slice being rewritten
    pub image: &'a mut MachImage,
    /// Caller intent
    pub config: &'a RewriteConfig,
    /// Dependency names in original load order
    pub orig_libs: Vec<String>,
    /// Original 1-based ordinal of each dependency
    pub orig_ordinals: HashMap<String, u8>,
    /// Which library each imported symbol binds against
    pub orig_sym_libs: BTreeMap<String, String>,
    /// Dependencies chosen for removal
    pub removal_set: BTreeSet<String>,
    /// Imported symbols whose library is being removed
    pub orphaned_symbols: BTreeSet<String>,
}

impl<'a> RewriteContext<'a> {
    /// Creates an empty context for one slice.
    pub fn new(image: &'a mut MachImage, config: &'a RewriteConfig) -> Self {
        Self {
            image,
            config,
            orig_libs: Vec::new(),
            orig_ordinals: HashMap::new(),
            orig_sym_libs: BTreeMap::new(),
            removal_set: BTreeSet::new(),
            orphaned_symbols: BTreeSet::new(),
        }
    }

    /// Returns the slice's architecture name for diagnostics.
    pub fn arch_name(&self) -> &'static str {
        self.image.header.arch_name()
    }
}
