//! Safe SQL identifier handling.
//!
//! [`Ident`] wraps a validated identifier (table or column name, optionally
//! dotted as `table.column`). Identifiers cannot be parameterized in
//! Postgres, so every dynamic name is validated against
//! `[A-Za-z_][A-Za-z0-9_$]*` per segment before it is spliced into SQL.

use crate::error::{OrmError, OrmResult};

/// A validated SQL identifier (column, table, or `table.column`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    /// Parse and validate an identifier, supporting dotted notation.
    pub fn parse(s: &str) -> OrmResult<Self> {
        if s.is_empty() {
            return Err(OrmError::validation("Identifier cannot be empty"));
        }

        for seg in s.split('.') {
            let mut chars = seg.chars();
            let Some(first) = chars.next() else {
                return Err(OrmError::validation(format!("Invalid identifier '{s}'")));
            };
            if first != '_' && !first.is_ascii_alphabetic() {
                return Err(OrmError::validation(format!(
                    "Invalid identifier start character in '{s}'"
                )));
            }
            if !chars.all(|c| c == '_' || c == '$' || c.is_ascii_alphanumeric()) {
                return Err(OrmError::validation(format!(
                    "Invalid character in identifier '{s}'"
                )));
            }
        }

        Ok(Self(s.to_string()))
    }

    /// Render the identifier as SQL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert an input into an [`Ident`].
///
/// This is mainly for ergonomics in builder APIs.
pub trait IntoIdent {
    fn into_ident(self) -> OrmResult<Ident>;
}

impl IntoIdent for Ident {
    fn into_ident(self) -> OrmResult<Ident> {
        Ok(self)
    }
}

impl IntoIdent for &Ident {
    fn into_ident(self) -> OrmResult<Ident> {
        Ok(self.clone())
    }
}

impl IntoIdent for &str {
    fn into_ident(self) -> OrmResult<Ident> {
        Ident::parse(self)
    }
}

impl IntoIdent for String {
    fn into_ident(self) -> OrmResult<Ident> {
        Ident::parse(&self)
    }
}
