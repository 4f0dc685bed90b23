//! Configuration for the obfuscation engine.
//!
//! This module provides [`ObfuscatorParameters`], which controls how generated types are
//! named, which declaring types are processed and whether synthesized bodies are verified.

/// Configuration for the obfuscation engine.
#[derive(Debug, Clone)]
pub struct ObfuscatorParameters {
    /// Give generated types and members compiler-style names such as `<Main>d__3`
    /// (default: `true`).
    ///
    /// When disabled, plain names derived from the method token are used instead, e.g.
    /// `Frame_06000003`.
    pub use_anonymous_types: bool,

    /// Full names of the declaring types to process (default: `None`, all types).
    pub type_filter: Option<Vec<String>>,

    /// Run the stack verifier on every synthesized body (default: `true`).
    ///
    /// The verified depth becomes the body's `max_stack`. Without verification every
    /// synthesized body keeps the assembler default of 8.
    pub verify_stack: bool,
}

impl Default for ObfuscatorParameters {
    fn default() -> Self {
        Self {
            use_anonymous_types: true,
            type_filter: None,
            verify_stack: true,
        }
    }
}

impl ObfuscatorParameters {
    /// Creates the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts processing to the types named in a comma-separated list.
    ///
    /// Whitespace around names is ignored, empty entries are dropped. A list without any
    /// name removes the restriction.
    #[must_use]
    pub fn with_type_filter(mut self, names: &str) -> Self {
        let names: Vec<String> = names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
            .collect();

        self.type_filter = if names.is_empty() { None } else { Some(names) };
        self
    }

    /// Uses plain instead of compiler-style names for generated types
    #[must_use]
    pub fn with_plain_names(mut self) -> Self {
        self.use_anonymous_types = false;
        self
    }

    /// Returns `true` if methods of the type with the given full name are processed
    #[must_use]
    pub fn accepts_type(&self, full_name: &str) -> bool {
        match &self.type_filter {
            Some(names) => names.iter().any(|name| name == full_name),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let parameters = ObfuscatorParameters::default();
        assert!(parameters.use_anonymous_types);
        assert!(parameters.verify_stack);
        assert!(parameters.accepts_type("Anything.At.All"));
    }

    #[test]
    fn type_filter_parsing() {
        let parameters = ObfuscatorParameters::new().with_type_filter(" App.Program, ,App.Util/Nested ");
        assert_eq!(
            parameters.type_filter,
            Some(vec!["App.Program".to_string(), "App.Util/Nested".to_string()])
        );
        assert!(parameters.accepts_type("App.Program"));
        assert!(parameters.accepts_type("App.Util/Nested"));
        assert!(!parameters.accepts_type("App.Util"));

        let cleared = parameters.with_type_filter(" , ");
        assert!(cleared.type_filter.is_none());
    }
}
