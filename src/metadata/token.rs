//! Metadata tokens addressing the rows of a module.

use std::fmt;

/// A metadata token referencing a row of one of the module tables.
///
/// Tokens consist of a 32-bit value where:
/// - The high byte (bits 24-31) indicates the table
/// - The low 24 bits (bits 0-23) hold the 1-based row id (rid)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Table id of type definitions
    pub const TYPE_DEF: u8 = 0x02;
    /// Table id of field definitions
    pub const FIELD: u8 = 0x04;
    /// Table id of method definitions
    pub const METHOD_DEF: u8 = 0x06;

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a 1-based row id
    #[must_use]
    pub fn from_parts(table: u8, rid: u32) -> Self {
        Token((u32::from(table) << 24) | (rid & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Zero-based index of the referenced row, `None` for a null row
    pub(crate) fn index(&self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parts() {
        let token = Token::from_parts(Token::METHOD_DEF, 5);
        assert_eq!(token.value(), 0x06000005);
        assert_eq!(token.table(), Token::METHOD_DEF);
        assert_eq!(token.row(), 5);
        assert_eq!(token.index(), Some(4));
    }

    #[test]
    fn test_token_null() {
        assert!(Token(0).is_null());
        assert_eq!(Token::from_parts(Token::TYPE_DEF, 0).index(), None);
    }

    #[test]
    fn test_token_display() {
        let token = Token::from_parts(Token::TYPE_DEF, 0x1a);
        assert_eq!(format!("{token}"), "0x0200001a");
        assert_eq!(
            format!("{token:?}"),
            "Token(0x0200001a, table: 0x02, row: 26)"
        );
    }
}
