//! Debug-symbol lookup, used when an injected function has to call into
//! the target binary by name because the address differs per build.

/// Maps C symbol names to relative virtual addresses.
///
/// Implementations sit on top of whatever debug information the target's
/// build left behind; names may carry `_`/`@N` decoration and resolving
/// them is the implementation's business.
pub trait SymbolSource {
    /// RVA of the named function, or `None` when the debug data has no
    /// record of it.
    fn resolve(&self, name: &str) -> Option<u32>;

    /// True when the debug data carries no section table, in which case
    /// its addresses are relative to the section containing the symbol
    /// and the engine adds that section's base itself.
    fn section_relative(&self) -> bool {
        false
    }
}
