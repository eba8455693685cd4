use std::borrow::Cow;


/// Demangle a symbol name, on a best-effort basis.
///
/// Rust and C++ manglings are attempted in that order; anything else
/// (including Go's dotted names, which are not mangled) passes through
/// unchanged.
#[cfg(feature = "demangle")]
pub(crate) fn maybe_demangle(name: &str) -> Cow<'_, str> {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        // The alternate format omits the trailing hash.
        return Cow::Owned(format!("{demangled:#}"))
    }

    if name.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
                return Cow::Owned(demangled)
            }
        }
    }

    Cow::Borrowed(name)
}

#[cfg(not(feature = "demangle"))]
pub(crate) fn maybe_demangle(name: &str) -> Cow<'_, str> {
    Cow::Borrowed(name)
}


#[cfg(test)]
#[cfg(feature = "demangle")]
mod tests {
    use super::*;


    /// Check that Rust, C++, and unmangled names all come out readable.
    #[test]
    fn demangling() {
        assert_eq!(
            maybe_demangle("_ZN4core3ptr13drop_in_place17h2acc3b57d4a97b93E"),
            "core::ptr::drop_in_place"
        );
        assert_eq!(maybe_demangle("_ZN4what4lulzE"), "what::lulz");
        assert_eq!(maybe_demangle("malloc"), "malloc");
        assert_eq!(maybe_demangle("main.helper"), "main.helper");
    }
}
