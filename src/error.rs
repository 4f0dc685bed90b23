use thiserror::Error;

use crate::{emulation::EmulationError, metadata::token::Token};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! unsupported_error {
    ($fmt:expr) => {
        crate::Error::UnsupportedConstruct($fmt.to_string())
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::UnsupportedConstruct(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Method-level Errors
/// - [`Error::UnsupportedConstruct`] - The method uses something the transformation can not
///   express. The method is left untouched and the batch continues.
/// - [`Error::Malformed`] - Broken input or an internal inconsistency, such as a branch to an
///   unknown label or an unbalanced evaluation stack
/// - [`Error::Transform`] - Wraps one of the above with the name of the method it occurred in
///
/// ## Lookup Errors
/// - [`Error::TypeNotFound`], [`Error::FieldNotFound`], [`Error::MethodNotFound`]
///
/// ## Output Errors
/// - [`Error::Write`] - Serializing the transformed module failed, fatal to the run
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Emulation Errors
/// - [`Error::Emulation`] - The reference emulator could not execute a body
///
/// # Examples
///
/// ```rust
/// use awaitscope::Error;
///
/// let inner = Error::UnsupportedConstruct("dup".to_string());
/// let err = Error::Transform {
///     method: "Program::Main".to_string(),
///     source: Box::new(inner),
/// };
/// assert_eq!(
///     err.chain(),
///     "[!] Failed to transform Program::Main\n[!]   Unsupported construct - dup"
/// );
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The method contains a construct the transformation does not support.
    ///
    /// Recovered at method granularity: the method is reported and left unmodified.
    #[error("Unsupported construct - {0}")]
    UnsupportedConstruct(String),

    /// The input is damaged or an internal invariant did not hold.
    ///
    /// The error includes the source location where the problem was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A type token did not resolve to a row of the module.
    #[error("Failed to find type - {0}")]
    TypeNotFound(Token),

    /// A field token did not resolve to a row of the module.
    #[error("Failed to find field - {0}")]
    FieldNotFound(Token),

    /// A method token did not resolve to a row of the module.
    #[error("Failed to find method - {0}")]
    MethodNotFound(Token),

    /// Transforming a single method failed.
    #[error("Failed to transform {method}")]
    Transform {
        /// Full name of the method
        method: String,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// Writing the transformed module failed.
    #[error("Failed to write {path}")]
    Write {
        /// Destination of the write
        path: String,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The reference emulator failed to execute a body.
    #[error("Emulation failed - {0}")]
    Emulation(#[from] EmulationError),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Returns `true` for errors that only concern a single method and must not abort a run.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::UnsupportedConstruct(_)
            | Error::Malformed { .. }
            | Error::TypeNotFound(_)
            | Error::FieldNotFound(_)
            | Error::MethodNotFound(_) => true,
            Error::Transform { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Renders this error and all of its causes, one per line.
    ///
    /// Every line starts with `[!] `, each inner cause is indented by two more spaces than its
    /// parent.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut lines = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        let mut depth = 0;

        while let Some(err) = current {
            lines.push(format!("[!] {}{}", "  ".repeat(depth), err));
            current = err.source();
            depth += 1;
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_indents_every_cause() {
        let err = Error::Write {
            path: "out/app.dll".to_string(),
            source: Box::new(Error::Transform {
                method: "Program::Main".to_string(),
                source: Box::new(Error::UnsupportedConstruct("switch".to_string())),
            }),
        };

        let chain = err.chain();
        let lines: Vec<&str> = chain.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "[!] Failed to write out/app.dll");
        assert_eq!(lines[1], "[!]   Failed to transform Program::Main");
        assert_eq!(lines[2], "[!]     Unsupported construct - switch");
    }

    #[test]
    fn recoverable_errors() {
        assert!(unsupported_error!("dup").is_recoverable());
        assert!(malformed_error!("label {} missing", 3).is_recoverable());
        assert!(!Error::Write {
            path: String::new(),
            source: Box::new(Error::Error("disk full".into())),
        }
        .is_recoverable());
    }
}
