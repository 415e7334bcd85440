//! Parse diagnostics.
//!
//! Decoders never log while a parse is in flight. Recoverable anomalies are
//! pushed into a [`Diagnostics`] collector threaded through every decode
//! call, and the caller flushes the collector once the parse has completed.

use std::fmt;

use log::warn;

/// A recoverable anomaly found while scanning a codestream.
///
/// The offending raw value is always retained alongside the byte offset of
/// the marker segment it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A marker code outside the known set, including the reserved ranges.
    UnrecognizedMarker { marker: [u8; 2], offset: u64 },
    /// A progression order value outside the five defined orders (A.6.1).
    InvalidProgressionOrder { value: u8, offset: u64 },
    /// Decomposition levels implying a resolution count outside [1, 33].
    InvalidNumberOfResolutions { num_resolutions: u16, offset: u64 },
    /// A wavelet transformation identifier other than 0 (9-7) or 1 (5-3).
    InvalidWaveletTransform { value: u8, offset: u64 },
    /// A component subsampling factor of zero (A.5.1).
    InvalidSubsampling {
        component: u16,
        dx: u8,
        dy: u8,
        offset: u64,
    },
    /// A tile grid describing an implausible number of tiles.
    InvalidNumberOfTiles { num_tiles: u64, offset: u64 },
    /// Code-block dimensions outside [4, 1024] or exceeding 4096 samples.
    InvalidCodeblockSize { width: u32, height: u32, offset: u64 },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Warning::UnrecognizedMarker { marker, offset } => write!(
                f,
                "unrecognized marker 0x{:02X}{:02X} at offset {}",
                marker[0], marker[1], offset
            ),
            Warning::InvalidProgressionOrder { value, offset } => write!(
                f,
                "invalid progression order {} at offset {}",
                value, offset
            ),
            Warning::InvalidNumberOfResolutions {
                num_resolutions,
                offset,
            } => write!(
                f,
                "invalid number of resolutions {} at offset {}",
                num_resolutions, offset
            ),
            Warning::InvalidWaveletTransform { value, offset } => write!(
                f,
                "invalid wavelet transformation {} at offset {}",
                value, offset
            ),
            Warning::InvalidSubsampling {
                component,
                dx,
                dy,
                offset,
            } => write!(
                f,
                "invalid subsampling factors ({}, {}) for component {} at offset {}",
                dx, dy, component, offset
            ),
            Warning::InvalidNumberOfTiles { num_tiles, offset } => write!(
                f,
                "invalid number of tiles {} at offset {}",
                num_tiles, offset
            ),
            Warning::InvalidCodeblockSize {
                width,
                height,
                offset,
            } => write!(
                f,
                "invalid code-block size {}x{} at offset {}",
                width, height, offset
            ),
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

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    /// Drains the collected warnings out of the collector.
    pub fn take(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Reports every collected warning through the log facade.
    ///
    /// Call once, after the parse that filled the collector has returned.
    pub fn flush(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }
    }
}
