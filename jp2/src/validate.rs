//! Write-time structural validation.
//!
//! Every rule here is a hard error: a box list that fails is never written.
//! Parsing is deliberately more lenient; these rules only gate
//! re-serialization and wrapping.

use std::error;
use std::fmt;

use crate::{
    BoxKind, Jp2Box, BRAND_JP2, BRAND_JPX, COLOURSPACE_GREYSCALE, COLOURSPACE_SRGB,
    COLOURSPACE_SYCC, COMPATIBILITY_JPXB,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    FirstBoxNotSignature,
    SecondBoxNotFileType,
    InvalidBrand { brand: [u8; 4] },
    /// The compatibility list names none of the brands this format family
    /// defines.
    InvalidCompatibilityList,
    MissingCodestream,
    MissingJp2Header,
    MultipleJp2Header,
    /// The JP2 header superbox must precede the first codestream box.
    Jp2HeaderAfterCodestream,
    EmptyJp2Header,
    FirstHeaderChildNotImageHeader,
    MissingColourSpecification,
    MultipleColourSpecification,
    MultipleChannelDefinition,
    /// A palette box is only meaningful inside the JP2 header superbox.
    PaletteOutsideHeader,
    ChannelDefinitionOutsideHeader,
    /// A colour specification with neither an enumerated colourspace nor an
    /// ICC profile.
    MissingColourData,
    /// The approximation field must be zero in a plain JP2 file.
    InvalidApproximation { value: u8 },
    /// The channel definitions do not cover colour channel `channel` of the
    /// declared colourspace.
    MissingColourChannel { channel: u16 },
    /// A rewrapped box recorded at one position would be written at another.
    BoxOffsetMismatch { declared: u64, actual: u64 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::FirstBoxNotSignature => {
                write!(f, "the first box must be the signature box")
            }
            ValidationError::SecondBoxNotFileType => {
                write!(f, "the second box must be the file type box")
            }
            ValidationError::InvalidBrand { brand } => write!(
                f,
                "brand {:?} is not a JP2 family brand",
                String::from_utf8_lossy(brand)
            ),
            ValidationError::InvalidCompatibilityList => {
                write!(f, "the compatibility list names no JP2 family brand")
            }
            ValidationError::MissingCodestream => {
                write!(f, "a contiguous codestream box is required")
            }
            ValidationError::MissingJp2Header => {
                write!(f, "a JP2 header superbox is required")
            }
            ValidationError::MultipleJp2Header => {
                write!(f, "only one JP2 header superbox is allowed")
            }
            ValidationError::Jp2HeaderAfterCodestream => {
                write!(f, "the JP2 header must precede the first codestream box")
            }
            ValidationError::EmptyJp2Header => {
                write!(f, "the JP2 header superbox must not be empty")
            }
            ValidationError::FirstHeaderChildNotImageHeader => {
                write!(f, "the first child of the JP2 header must be the image header")
            }
            ValidationError::MissingColourSpecification => {
                write!(f, "the JP2 header must hold a colour specification box")
            }
            ValidationError::MultipleColourSpecification => {
                write!(f, "only one colour specification box is allowed")
            }
            ValidationError::MultipleChannelDefinition => {
                write!(f, "only one channel definition box is allowed")
            }
            ValidationError::PaletteOutsideHeader => {
                write!(f, "a palette box may only appear inside the JP2 header")
            }
            ValidationError::ChannelDefinitionOutsideHeader => {
                write!(
                    f,
                    "a channel definition box may only appear inside the JP2 header"
                )
            }
            ValidationError::MissingColourData => {
                write!(
                    f,
                    "a colour specification needs an enumerated colourspace or an ICC profile"
                )
            }
            ValidationError::InvalidApproximation { value } => {
                write!(f, "approximation must be 0 in a JP2 file, found {}", value)
            }
            ValidationError::MissingColourChannel { channel } => write!(
                f,
                "no channel definition covers colour channel {}",
                channel
            ),
            ValidationError::BoxOffsetMismatch { declared, actual } => write!(
                f,
                "box recorded at offset {} would be written at offset {}",
                declared, actual
            ),
        }
    }
}

impl error::Error for ValidationError {}

/// Checks the structural rules a writable box list must satisfy.
pub fn validate_boxes(boxes: &[Jp2Box]) -> Result<(), ValidationError> {
    match boxes.first().map(|b| &b.kind) {
        Some(BoxKind::Signature) => {}
        _ => return Err(ValidationError::FirstBoxNotSignature),
    }
    let file_type = match boxes.get(1).map(|b| &b.kind) {
        Some(BoxKind::FileType(ft)) => ft,
        _ => return Err(ValidationError::SecondBoxNotFileType),
    };
    if file_type.brand != BRAND_JP2 && file_type.brand != BRAND_JPX {
        return Err(ValidationError::InvalidBrand {
            brand: file_type.brand,
        });
    }
    if !file_type
        .compatibility
        .iter()
        .any(|e| *e == BRAND_JP2 || *e == BRAND_JPX || *e == COMPATIBILITY_JPXB)
    {
        return Err(ValidationError::InvalidCompatibilityList);
    }

    let codestream_index = boxes
        .iter()
        .position(|b| matches!(b.kind, BoxKind::ContiguousCodestream(_)))
        .ok_or(ValidationError::MissingCodestream)?;

    let header_indices: Vec<usize> = boxes
        .iter()
        .enumerate()
        .filter(|(_, b)| matches!(b.kind, BoxKind::Jp2Header(_)))
        .map(|(i, _)| i)
        .collect();
    let header_index = match header_indices.as_slice() {
        [] => return Err(ValidationError::MissingJp2Header),
        [index] => *index,
        _ => return Err(ValidationError::MultipleJp2Header),
    };
    if header_index > codestream_index {
        return Err(ValidationError::Jp2HeaderAfterCodestream);
    }

    for b in boxes {
        match b.kind {
            BoxKind::Palette(_) => return Err(ValidationError::PaletteOutsideHeader),
            BoxKind::ChannelDefinition(_) => {
                return Err(ValidationError::ChannelDefinitionOutsideHeader)
            }
            _ => {}
        }
    }

    let children = match &boxes[header_index].kind {
        BoxKind::Jp2Header(children) => children,
        _ => unreachable!(),
    };
    if children.is_empty() {
        return Err(ValidationError::EmptyJp2Header);
    }
    let image_header = match &children[0].kind {
        BoxKind::ImageHeader(ihdr) => ihdr,
        _ => return Err(ValidationError::FirstHeaderChildNotImageHeader),
    };

    let colour_boxes: Vec<_> = children
        .iter()
        .filter_map(|b| match &b.kind {
            BoxKind::ColourSpecification(colr) => Some(colr),
            _ => None,
        })
        .collect();
    let colour = match colour_boxes.as_slice() {
        [] => return Err(ValidationError::MissingColourSpecification),
        [colr] => *colr,
        _ => return Err(ValidationError::MultipleColourSpecification),
    };
    if colour.colourspace.is_none() && colour.icc_profile.is_none() {
        return Err(ValidationError::MissingColourData);
    }
    if file_type.brand == BRAND_JP2 && colour.approximation != 0 {
        return Err(ValidationError::InvalidApproximation {
            value: colour.approximation,
        });
    }

    let channel_definitions: Vec<_> = children
        .iter()
        .filter_map(|b| match &b.kind {
            BoxKind::ChannelDefinition(cdef) => Some(cdef),
            _ => None,
        })
        .collect();
    let channel_definition = match channel_definitions.as_slice() {
        [] => None,
        [cdef] => Some(*cdef),
        _ => return Err(ValidationError::MultipleChannelDefinition),
    };

    if let (Some(cdef), Some(colourspace)) = (channel_definition, colour.colourspace) {
        let colour_channels: u16 = match colourspace {
            COLOURSPACE_SRGB | COLOURSPACE_SYCC => 3,
            COLOURSPACE_GREYSCALE => 1,
            _ => 0,
        };
        let colour_channels = colour_channels.min(image_header.num_components);
        for channel in 0..colour_channels {
            let declared = cdef
                .channels
                .iter()
                .any(|c| c.index == channel && c.channel_type == 0);
            let associated = cdef.channels.iter().any(|c| c.association == channel + 1);
            if !declared || !associated {
                return Err(ValidationError::MissingColourChannel { channel });
            }
        }
    }

    Ok(())
}
