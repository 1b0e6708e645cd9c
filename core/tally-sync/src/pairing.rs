//! Pairing codes.
//!
//! A pairing code is shown on both devices while a session is set up so the
//! user can confirm they are connecting the right two devices. The answering
//! device echoes the code from the offer it scanned.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters used in pairing codes. Excludes 0/O and 1/I/L.
pub const PAIRING_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// A short human-comparable code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingCode(String);

impl PairingCode {
    /// Generates a random code of `length` characters.
    pub fn generate(length: usize) -> Self {
        let alphabet = PAIRING_ALPHABET.as_bytes();
        let mut rng = rand::thread_rng();
        let code = (0..length)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
            .collect();
        Self(code)
    }

    /// Creates a code from user input.
    /// Normalizes the input (trims, uppercases, drops spaces and dashes).
    pub fn from_input(input: &str, length: usize) -> Result<Self, PairingCodeError> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.chars().count() != length {
            return Err(PairingCodeError::WrongLength {
                expected: length,
                actual: normalized.chars().count(),
            });
        }
        if let Some(bad) = normalized.chars().find(|c| !PAIRING_ALPHABET.contains(*c)) {
            return Err(PairingCodeError::InvalidCharacter(bad));
        }
        Ok(Self(normalized))
    }

    /// Wraps a code received from the peer without validating it.
    pub(crate) fn from_raw(code: String) -> Self {
        Self(code)
    }

    /// The bare code.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The code split in two halves for display (`ABC-DEF`).
    pub fn display_grouped(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < 4 {
            return self.0.clone();
        }
        let (head, tail) = chars.split_at(chars.len().div_ceil(2));
        format!(
            "{}-{}",
            head.iter().collect::<String>(),
            tail.iter().collect::<String>()
        )
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors related to pairing codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingCodeError {
    WrongLength { expected: usize, actual: usize },
    InvalidCharacter(char),
}

impl fmt::Display for PairingCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { expected, actual } => {
                write!(f, "Pairing code must have {expected} characters, got {actual}")
            }
            Self::InvalidCharacter(c) => write!(f, "Invalid pairing code character: {c:?}"),
        }
    }
}

impl std::error::Error for PairingCodeError {}
