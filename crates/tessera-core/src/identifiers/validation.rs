//! Character and length rules shared by every identifier newtype

/// Longest identifier accepted, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 96;

/// Why a string was refused as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdValidationError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier is {len} bytes, limit is {MAX_IDENTIFIER_LEN}")]
    Oversized { len: usize },

    /// Byte offset and the offending character.
    #[error("identifier has {found:?} at offset {offset}; use letters, digits, '-', '_', '.' or ':'")]
    Disallowed { offset: usize, found: char },

    #[error("identifier must start with a letter or digit, found {0:?}")]
    BadLeading(char),
}

/// Separators allowed between alphanumeric runs. `:` namespaces
/// capabilities as in `search:semantic`.
const SEPARATORS: [char; 4] = ['-', '_', '.', ':'];

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || SEPARATORS.contains(&c)
}

/// Check `raw` against the identifier rules and hand it back unchanged.
pub(crate) fn check(raw: &str) -> Result<&str, IdValidationError> {
    let first = raw.chars().next().ok_or(IdValidationError::Empty)?;
    if raw.len() > MAX_IDENTIFIER_LEN {
        return Err(IdValidationError::Oversized { len: raw.len() });
    }
    if let Some((offset, found)) = raw.char_indices().find(|&(_, c)| !allowed(c)) {
        return Err(IdValidationError::Disallowed { offset, found });
    }
    if !first.is_ascii_alphanumeric() {
        return Err(IdValidationError::BadLeading(first));
    }
    Ok(raw)
}
