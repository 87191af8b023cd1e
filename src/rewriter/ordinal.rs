//! Library ordinal arithmetic.
//!
//! A classic symbol's 16-bit `n_desc` carries the owning library's ordinal in
//! its upper byte. The same 1-based ordinal namespace appears in the dyld-info
//! bind streams. Three values are sentinels and never participate in
//! remapping.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::macho::{DYNAMIC_LOOKUP_ORDINAL, EXECUTABLE_ORDINAL, SELF_LIBRARY_ORDINAL};

/// Extracts the library ordinal from a symbol description word.
#[inline]
pub const fn library_ordinal(desc: u16) -> u8 {
    (desc >> 8) as u8
}

/// Packs a library ordinal into a symbol description word.
#[inline]
pub const fn set_library_ordinal(desc: u16, ordinal: u8) -> u16 {
    (desc & 0x00FF) | ((ordinal as u16) << 8)
}

/// Returns true for the self / dynamic-lookup / executable sentinels.
#[inline]
pub const fn is_sentinel_ordinal(ordinal: u8) -> bool {
    matches!(
        ordinal,
        SELF_LIBRARY_ORDINAL | DYNAMIC_LOOKUP_ORDINAL | EXECUTABLE_ORDINAL
    )
}

/// Injection from original library ordinals to post-rewrite ordinals.
///
/// Built once per slice after the final shape of the dependency list is
/// known, then applied uniformly to the bind streams and the classic symbol
/// table.
#[derive(Debug, Clone, Default)]
pub struct OrdinalMap {
    map: HashMap<u8, u8>,
}

impl OrdinalMap {
    /// Records `old -> new`.
    pub fn insert(&mut self, old: u8, new: u8) {
        self.map.insert(old, new);
    }

    /// Looks up the image of `old`, if any.
    pub fn get(&self, old: u8) -> Option<u8> {
        self.map.get(&old).copied()
    }

    /// Looks up the image of `old`; a missing image for a non-sentinel
    /// ordinal is an invariant violation.
    pub fn remap(&self, old: u8) -> Result<u8> {
        self.get(old).ok_or(Error::OrdinalUnmapped { ordinal: old })
    }

    /// Returns true if no ordinal changes value.
    pub fn is_identity(&self) -> bool {
        self.map.iter().all(|(old, new)| old == new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        assert_eq!(library_ordinal(0x0200), 2);
        assert_eq!(library_ordinal(0x02FF), 2);
        assert_eq!(set_library_ordinal(0x02FF, 9), 0x09FF);
        let desc = set_library_ordinal(0, 0xFE);
        assert_eq!(library_ordinal(desc), 0xFE);
    }

    #[test]
    fn test_sentinels() {
        assert!(is_sentinel_ordinal(0x00));
        assert!(is_sentinel_ordinal(0xFE));
        assert!(is_sentinel_ordinal(0xFF));
        assert!(!is_sentinel_ordinal(1));
        assert!(!is_sentinel_ordinal(0xFD));
    }

    #[test]
    fn test_remap() {
        let mut map = OrdinalMap::default();
        map.insert(1, 1);
        map.insert(2, 1);
        assert_eq!(map.remap(2).unwrap(), 1);
        assert!(matches!(
            map.remap(3),
            Err(Error::OrdinalUnmapped { ordinal: 3 })
        ));
        assert!(!map.is_identity());
    }
}
