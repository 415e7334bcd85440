//! Parse diagnostics for the container layer.
//!
//! Same discipline as the codestream layer: recoverable anomalies are
//! collected while parsing and reported through the log facade only after
//! the parse has completed. Codestream anomalies found inside an embedded
//! codestream surface here wrapped in [`Warning::Codestream`].

use std::fmt;

use log::warn;

use crate::BoxId;

/// A recoverable anomaly found while parsing a box tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A box id outside the known vocabulary; its payload is kept opaque.
    UnrecognizedBox { id: BoxId, offset: u64 },
    /// A box whose declared extent does not fit its enclosing range. The
    /// box is abandoned; siblings are still attempted when possible.
    TruncatedBox {
        id: BoxId,
        offset: u64,
        detail: String,
    },
    /// Bytes at the end of a range too short to hold a box header.
    TrailingBytes { offset: u64, length: u64 },
    /// An embedded ICC profile declaring more bytes than its box holds.
    InvalidIccProfileLength {
        declared: u64,
        available: u64,
        offset: u64,
    },
    /// A file-type compatibility entry that is not UTF-8.
    NonUtf8CompatibilityEntry { entry: [u8; 4], offset: u64 },
    /// A colour specification method outside the defined range.
    InvalidColourMethod { method: u8, offset: u64 },
    /// An anomaly from an embedded codestream.
    Codestream(jpc::diag::Warning),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Warning::UnrecognizedBox { id, offset } => write!(
                f,
                "unrecognized box {:?} at offset {}",
                String::from_utf8_lossy(id),
                offset
            ),
            Warning::TruncatedBox { id, offset, detail } => write!(
                f,
                "truncated box {:?} at offset {}: {}",
                String::from_utf8_lossy(id),
                offset,
                detail
            ),
            Warning::TrailingBytes { offset, length } => write!(
                f,
                "{} trailing bytes at offset {} too short for a box header",
                length, offset
            ),
            Warning::InvalidIccProfileLength {
                declared,
                available,
                offset,
            } => write!(
                f,
                "ICC profile declares {} bytes but only {} are available at offset {}",
                declared, available, offset
            ),
            Warning::NonUtf8CompatibilityEntry { entry, offset } => write!(
                f,
                "compatibility entry {:02X?} at offset {} is not UTF-8",
                entry, offset
            ),
            Warning::InvalidColourMethod { method, offset } => write!(
                f,
                "invalid colour specification method {} at offset {}",
                method, offset
            ),
            Warning::Codestream(warning) => write!(f, "embedded codestream: {}", warning),
        }
    }
}

/// Collects [`Warning`]s during a parse.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn push(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    /// Adopts warnings collected by a codestream scan.
    pub fn absorb(&mut self, codestream: &mut jpc::diag::Diagnostics) {
        for warning in codestream.take() {
            self.warnings.push(Warning::Codestream(warning));
        }
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn take(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Reports every collected warning through the log facade.
    pub fn flush(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }
    }
}
