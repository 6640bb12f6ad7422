/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The fork database never verifies signatures: producing and checking BLS aggregates is the
//! concern of the finality machinery that sits above it. [`BlsSignature`] is a serialization
//! wrapper around the 96 compressed bytes of a G2 group element, with the prefixed Base64 text
//! form used everywhere such signatures are displayed or configured.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

/// Text prefix of the Base64 form of a [`BlsSignature`].
pub const BLS_SIGNATURE_PREFIX: &str = "SIG_BLS_";

/// A BLS aggregate signature: the 96 compressed big-endian bytes of a G2 element.
///
/// Comparison is byte-wise. Whether the bytes decode to a point on the curve is for the
/// finality machinery to decide.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlsSignature([u8; 96]);

impl BlsSignature {
    /// Create a new `BlsSignature` wrapping `bytes`.
    pub const fn new(bytes: [u8; 96]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 96]` value of this `BlsSignature`.
    pub const fn bytes(&self) -> [u8; 96] {
        self.0
    }
}

impl Display for BlsSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(BLS_SIGNATURE_PREFIX)?;
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl Debug for BlsSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for BlsSignature {
    type Err = BlsSignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = s
            .strip_prefix(BLS_SIGNATURE_PREFIX)
            .ok_or(BlsSignatureParseError::MissingPrefix)?;
        let bytes = STANDARD_NO_PAD
            .decode(data)
            .map_err(BlsSignatureParseError::Base64)?;
        let bytes: [u8; 96] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| BlsSignatureParseError::WrongLength { len: b.len() })?;
        Ok(BlsSignature(bytes))
    }
}

/// Ways in which the text form of a [`BlsSignature`] can be malformed.
#[derive(Debug)]
pub enum BlsSignatureParseError {
    MissingPrefix,
    Base64(base64::DecodeError),
    WrongLength { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_round_trips() {
        let sig = BlsSignature::new([0xAB; 96]);
        let text = sig.to_string();
        assert!(text.starts_with(BLS_SIGNATURE_PREFIX));
        assert_eq!(BlsSignature::from_str(&text).unwrap(), sig);
    }

    #[test]
    fn rejects_missing_prefix_and_wrong_length() {
        assert!(matches!(
            BlsSignature::from_str("SIG_K1_abcdef"),
            Err(BlsSignatureParseError::MissingPrefix)
        ));
        let short = format!("{}{}", BLS_SIGNATURE_PREFIX, STANDARD_NO_PAD.encode([1u8; 10]));
        assert!(matches!(
            BlsSignature::from_str(&short),
            Err(BlsSignatureParseError::WrongLength { len: 10 })
        ));
    }
}
