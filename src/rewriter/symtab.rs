//! Classic symbol table handling.
//!
//! The rewriter touches the symbol table twice: before mutation to snapshot
//! which library each undefined import binds against, and after the
//! dependency list has its final shape to remap the ordinals packed into
//! `n_desc`. Only undefined, non-debug entries carry an ordinal; defined and
//! stab entries reuse `n_desc` for other data and are left alone.

use tracing::trace;

use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{read_cstr, read_u16_le_at, write_u16_le_at};

use super::ordinal::{is_sentinel_ordinal, library_ordinal, set_library_ordinal, OrdinalMap};

/// Resolved symbol table bounds for one slice.
struct SymtabLayout {
    symoff: usize,
    nsyms: usize,
    stroff: usize,
    strsize: usize,
    stride: usize,
}

fn layout(image: &MachImage) -> Result<Option<SymtabLayout>> {
    let Some(symtab) = image.symtab() else {
        return Ok(None);
    };
    let stride = if image.is64 {
        Nlist64::SIZE
    } else {
        Nlist32::SIZE
    };
    let layout = SymtabLayout {
        symoff: symtab.symoff as usize,
        nsyms: symtab.nsyms as usize,
        stroff: symtab.stroff as usize,
        strsize: symtab.strsize as usize,
        stride,
    };
    let table_end = layout.symoff + layout.nsyms * layout.stride;
    if table_end > image.data.len() {
        return Err(Error::parse(
            layout.symoff,
            "symbol table extends beyond the slice",
        ));
    }
    if layout.stroff + layout.strsize > image.data.len() {
        return Err(Error::parse(
            layout.stroff,
            "string table extends beyond the slice",
        ));
    }
    Ok(Some(layout))
}

fn is_undefined_import(n_type: u8) -> bool {
    if n_type & N_STAB != 0 {
        return false;
    }
    matches!(n_type & N_TYPE, N_UNDF | N_PBUD)
}

/// Returns `(name, packed ordinal)` for every undefined, non-stab symbol.
///
/// Sentinel ordinals are included; callers filter as needed.
pub fn undefined_imports(image: &MachImage) -> Result<Vec<(String, u8)>> {
    let Some(layout) = layout(image)? else {
        return Ok(Vec::new());
    };

    let strtab = &image.data[layout.stroff..layout.stroff + layout.strsize];
    let mut imports = Vec::new();

    for index in 0..layout.nsyms {
        let off = layout.symoff + index * layout.stride;
        let n_type = image.data[off + NLIST_TYPE_OFFSET];
        if !is_undefined_import(n_type) {
            continue;
        }
        let n_strx = crate::util::read_u32_le_at(&image.data, off) as usize;
        if n_strx == 0 || n_strx >= layout.strsize {
            continue;
        }
        let name = read_cstr(strtab, n_strx)?;
        let n_desc = read_u16_le_at(&image.data, off + NLIST_DESC_OFFSET);
        imports.push((name.to_string(), library_ordinal(n_desc)));
    }

    Ok(imports)
}

/// Remaps the packed ordinal of every undefined import through `map`.
///
/// Sentinels are preserved. Returns the number of entries rewritten.
pub fn remap_import_ordinals(image: &mut MachImage, map: &OrdinalMap) -> Result<usize> {
    let Some(layout) = layout(image)? else {
        return Ok(0);
    };

    let mut remapped = 0;
    for index in 0..layout.nsyms {
        let off = layout.symoff + index * layout.stride;
        let n_type = image.data[off + NLIST_TYPE_OFFSET];
        if !is_undefined_import(n_type) {
            continue;
        }
        let n_desc = read_u16_le_at(&image.data, off + NLIST_DESC_OFFSET);
        let ordinal = library_ordinal(n_desc);
        if is_sentinel_ordinal(ordinal) {
            continue;
        }
        let new = map.remap(ordinal)?;
        if new != ordinal {
            trace!("symtab entry {}: ordinal {} -> {}", index, ordinal, new);
        }
        write_u16_le_at(
            &mut image.data,
            off + NLIST_DESC_OFFSET,
            set_library_ordinal(n_desc, new),
        );
        remapped += 1;
    }

    Ok(remapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::testutil::{self, ExecutableSpec, SymbolSpec};

    #[test]
    fn test_undefined_imports() {
        let data = testutil::build_executable(&ExecutableSpec::default());
        let image = MachImage::parse(&data).unwrap();
        let imports = undefined_imports(&image).unwrap();
        assert_eq!(
            imports,
            vec![("_foo".to_string(), 2), ("_bar".to_string(), 1)]
        );
    }

    #[test]
    fn test_remap_ordinals() {
        let data = testutil::build_executable(&ExecutableSpec::default());
        let mut image = MachImage::parse(&data).unwrap();

        let mut map = OrdinalMap::default();
        map.insert(1, 1);
        map.insert(2, 1);
        assert_eq!(remap_import_ordinals(&mut image, &map).unwrap(), 2);

        let imports = undefined_imports(&image).unwrap();
        assert_eq!(
            imports,
            vec![("_foo".to_string(), 1), ("_bar".to_string(), 1)]
        );
    }

    #[test]
    fn test_remap_preserves_sentinels() {
        let spec = ExecutableSpec {
            symbols: vec![
                SymbolSpec::undefined("_dyn", DYNAMIC_LOOKUP_ORDINAL),
                SymbolSpec::undefined("_exe", EXECUTABLE_ORDINAL),
                SymbolSpec::undefined("_foo", 1),
            ],
            ..Default::default()
        };
        let data = testutil::build_executable(&spec);
        let mut image = MachImage::parse(&data).unwrap();

        let mut map = OrdinalMap::default();
        map.insert(1, 2);
        assert_eq!(remap_import_ordinals(&mut image, &map).unwrap(), 1);

        let imports = undefined_imports(&image).unwrap();
        assert_eq!(imports[0].1, DYNAMIC_LOOKUP_ORDINAL);
        assert_eq!(imports[1].1, EXECUTABLE_ORDINAL);
        assert_eq!(imports[2].1, 2);
    }

    #[test]
    fn test_unmapped_ordinal_is_invariant_violation() {
        let spec = ExecutableSpec {
            symbols: vec![SymbolSpec::undefined("_ghost", 9)],
            ..Default::default()
        };
        let data = testutil::build_executable(&spec);
        let mut image = MachImage::parse(&data).unwrap();

        let mut map = OrdinalMap::default();
        map.insert(1, 1);
        assert!(matches!(
            remap_import_ordinals(&mut image, &map),
            Err(Error::OrdinalUnmapped { ordinal: 9 })
        ));
    }
}
