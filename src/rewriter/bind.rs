//! Dyld-info bind opcode streams.
//!
//! Two operations on the compressed bind format: extracting `(symbol,
//! ordinal)` records for the pre-mutation snapshot, and rewriting the library
//! ordinals carried by `SET_DYLIB_ORDINAL_*` opcodes while preserving every
//! other opcode byte-for-byte.
//!
//! Lazy streams use `BIND_OPCODE_DONE` as a record separator; regular and
//! weak streams treat it as a terminator, with anything after it copied
//! through as padding.

use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{leb128_len, read_uleb128, write_uleb128, write_uleb128_padded};

use super::ordinal::OrdinalMap;

/// One bind record: the snapshot only needs the symbol and its ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRecord {
    /// Symbol name as it appears in the stream
    pub symbol: String,
    /// Library ordinal; sentinels are 0 and negative values
    pub ordinal: i64,
}

/// Locates the end of the null-terminated symbol name starting at `offset`.
fn symbol_end(data: &[u8], offset: usize) -> Result<usize> {
    memchr::memchr(0, &data[offset.min(data.len())..])
        .map(|nul| offset + nul + 1)
        .ok_or_else(|| Error::parse(offset, "unterminated symbol name in bind stream"))
}

/// Parses the bind records of one opcode stream.
pub fn parse_bind_records(data: &[u8], lazy: bool) -> Result<Vec<BindRecord>> {
    let mut records = Vec::new();
    let mut symbol = String::new();
    let mut ordinal: i64 = 0;
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        let imm = byte & BIND_IMMEDIATE_MASK;
        let opcode = byte & BIND_OPCODE_MASK;
        i += 1;

        match opcode {
            BIND_OPCODE_DONE => {
                if !lazy {
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = imm as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (value, len) = read_uleb128(data, i)?;
                ordinal = value as i64;
                i += len;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // Sign-extend the 4-bit immediate: 0xF is -1, 0xE is -2.
                ordinal = if imm == 0 { 0 } else { (imm | 0xF0) as i8 as i64 };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let end = symbol_end(data, i)?;
                symbol = String::from_utf8_lossy(&data[i..end - 1]).into_owned();
                i = end;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB
            | BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
            | BIND_OPCODE_ADD_ADDR_ULEB => {
                i += leb128_len(data, i)?;
            }
            BIND_OPCODE_DO_BIND | BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                records.push(BindRecord {
                    symbol: symbol.clone(),
                    ordinal,
                });
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                records.push(BindRecord {
                    symbol: symbol.clone(),
                    ordinal,
                });
                i += leb128_len(data, i)?;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                // N binds of the same symbol; one record is enough for the
                // snapshot.
                records.push(BindRecord {
                    symbol: symbol.clone(),
                    ordinal,
                });
                let count_len = leb128_len(data, i)?;
                let skip_len = leb128_len(data, i + count_len)?;
                i += count_len + skip_len;
            }
            _ => {
                return Err(Error::parse(
                    i - 1,
                    format!("unknown bind opcode {byte:#04x}"),
                ));
            }
        }
    }

    Ok(records)
}

/// Rewrites the library ordinals of one opcode stream through `map`.
///
/// Sentinel ordinals (`SET_DYLIB_SPECIAL_IMM` and ordinal 0) pass through
/// unchanged. Ordinal opcodes that shrink are ULEB-padded to their original
/// width so the stream length is stable; a stream can only grow when an
/// immediate-encoded ordinal remaps past 15.
pub fn remap_stream(data: &[u8], map: &OrdinalMap, lazy: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        let imm = byte & BIND_IMMEDIATE_MASK;
        let opcode = byte & BIND_OPCODE_MASK;

        match opcode {
            BIND_OPCODE_DONE => {
                out.push(byte);
                i += 1;
                if !lazy {
                    // terminator; the remainder is padding
                    out.extend_from_slice(&data[i..]);
                    break;
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                i += 1;
                if imm == 0 {
                    out.push(byte);
                } else {
                    let new = map.remap(imm)?;
                    if new <= 0x0F {
                        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | new);
                    } else {
                        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                        write_uleb128(&mut out, new as u64);
                    }
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (value, len) = read_uleb128(data, i + 1)?;
                if value == 0 {
                    out.extend_from_slice(&data[i..i + 1 + len]);
                } else if value > u8::MAX as u64 {
                    return Err(Error::parse(i, format!("library ordinal {value} out of range")));
                } else {
                    let new = map.remap(value as u8)?;
                    out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                    write_uleb128_padded(&mut out, new as u64, len);
                }
                i += 1 + len;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM
            | BIND_OPCODE_SET_TYPE_IMM
            | BIND_OPCODE_DO_BIND
            | BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                out.push(byte);
                i += 1;
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let end = symbol_end(data, i + 1)?;
                out.extend_from_slice(&data[i..end]);
                i = end;
            }
            BIND_OPCODE_SET_ADDEND_SLEB
            | BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB
            | BIND_OPCODE_ADD_ADDR_ULEB
            | BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                let len = leb128_len(data, i + 1)?;
                out.extend_from_slice(&data[i..i + 1 + len]);
                i += 1 + len;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count_len = leb128_len(data, i + 1)?;
                let skip_len = leb128_len(data, i + 1 + count_len)?;
                let total = 1 + count_len + skip_len;
                out.extend_from_slice(&data[i..i + total]);
                i += total;
            }
            _ => {
                return Err(Error::parse(i, format!("unknown bind opcode {byte:#04x}")));
            }
        }
    }

    Ok(out)
}
