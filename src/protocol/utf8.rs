//! Incremental UTF-8 validation for fragmented text messages.

use crate::error::{Error, Result};

/// Validates UTF-8 across fragment boundaries.
///
/// A multi-byte sequence may be split between frames; up to 3 trailing
/// bytes of an incomplete sequence are stashed and re-checked with the
/// next fragment. A final fragment must leave nothing incomplete.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    incomplete: [u8; 3],
    incomplete_len: usize,
}

impl Utf8Validator {
    /// Create a fresh validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate one fragment of a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUtf8`] when the data cannot be a prefix of
    /// valid UTF-8, or when a final fragment ends mid-sequence.
    pub fn validate(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let check: std::borrow::Cow<'_, [u8]> = if self.incomplete_len > 0 {
            let mut combined = Vec::with_capacity(self.incomplete_len + data.len());
            combined.extend_from_slice(&self.incomplete[..self.incomplete_len]);
            combined.extend_from_slice(data);
            combined.into()
        } else {
            data.into()
        };
        self.incomplete_len = 0;

        if check.is_empty() {
            return Ok(());
        }

        match std::str::from_utf8(&check) {
            Ok(_) => Ok(()),
            Err(e) => {
                // error_len() is None only for a truncated sequence at the
                // end of the input; a valid partial sequence is at most 3
                // bytes (4 still-invalid trailing bytes mean garbage).
                if !is_final && e.error_len().is_none() {
                    let tail = &check[e.valid_up_to()..];
                    if tail.len() <= 3 {
                        self.incomplete[..tail.len()].copy_from_slice(tail);
                        self.incomplete_len = tail.len();
                        return Ok(());
                    }
                }
                Err(Error::invalid_text())
            }
        }
    }

    /// Discard any stashed partial sequence.
    pub fn reset(&mut self) {
        self.incomplete_len = 0;
    }

    /// Whether a partial sequence is pending completion.
    #[must_use]
    pub fn has_incomplete(&self) -> bool {
        self.incomplete_len > 0
    }
}
