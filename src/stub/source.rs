//! Objective-C source generation for the stub dylib.
//!
//! Every orphaned symbol gets exactly one placeholder definition:
//! `_OBJC_CLASS_$_Name` becomes an empty `NSObject` subclass, and any other
//! `_`-prefixed name becomes a void function that trips a release-proof
//! assertion when called. Other symbol shapes are unsupported and fatal.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::error::{Error, Result};

/// Raw-symbol prefix of Objective-C class symbols.
pub const OBJC_CLASS_PREFIX: &str = "_OBJC_CLASS_$_";

/// Generates the stub's Objective-C source for the given exported symbols.
///
/// The symbol set is ordered, so output is deterministic for a given orphan
/// set. Assertions stay armed in release builds (`#undef NDEBUG`).
pub fn generate_stub_source(symbols: &BTreeSet<String>) -> Result<String> {
    let mut source = String::from(
        "#undef NDEBUG\n\
         #include <assert.h>\n\
         #import <Foundation/Foundation.h>\n",
    );

    for symbol in symbols {
        if let Some(class_name) = symbol.strip_prefix(OBJC_CLASS_PREFIX) {
            let _ = write!(
                source,
                "\n@interface {class_name} : NSObject\n\
                 @end\n\
                 @implementation {class_name}\n\
                 @end\n"
            );
        } else if let Some(name) = symbol.strip_prefix('_') {
            let _ = write!(
                source,
                "\nvoid {name}(void) {{\n    assert(!\"unimplemented symbol '{name}'\");\n}}\n"
            );
        } else {
            return Err(Error::UnsupportedStubSymbol {
                name: symbol.clone(),
            });
        }
    }

    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_function_stub() {
        let source = generate_stub_source(&symbols(&["_frobnicate"])).unwrap();
        assert!(source.contains("void frobnicate(void)"));
        assert!(source.contains("unimplemented symbol 'frobnicate'"));
        assert!(source.starts_with("#undef NDEBUG"));
        assert!(source.contains("#import <Foundation/Foundation.h>"));
    }

    #[test]
    fn test_class_stub() {
        let source = generate_stub_source(&symbols(&["_OBJC_CLASS_$_Bar"])).unwrap();
        assert!(source.contains("@interface Bar : NSObject"));
        assert!(source.contains("@implementation Bar"));
        // The class prefix must not fall through to the function rule.
        assert!(!source.contains("void OBJC_CLASS"));
    }

    #[test]
    fn test_each_symbol_defined_once() {
        let source =
            generate_stub_source(&symbols(&["_a", "_b", "_OBJC_CLASS_$_C"])).unwrap();
        assert_eq!(source.matches("void a(void)").count(), 1);
        assert_eq!(source.matches("void b(void)").count(), 1);
        assert_eq!(source.matches("@implementation C").count(), 1);
    }

    #[test]
    fn test_deterministic_order() {
        let a = generate_stub_source(&symbols(&["_z", "_a"])).unwrap();
        let b = generate_stub_source(&symbols(&["_a", "_z"])).unwrap();
        assert_eq!(a, b);
        assert!(a.find("void a(void)").unwrap() < a.find("void z(void)").unwrap());
    }

    #[test]
    fn test_unsupported_prefix() {
        assert!(matches!(
            generate_stub_source(&symbols(&["no_underscore"])),
            Err(Error::UnsupportedStubSymbol { .. })
        ));
    }
}
