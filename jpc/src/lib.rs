//! Structural parsing of JPEG 2000 codestreams (ISO/IEC 15444-1 Annex A).
//!
//! A codestream is a sequence of marker segments. This crate scans the main
//! header and, on request, every tile-part header, producing typed segment
//! values without touching the entropy-coded data. Recoverable anomalies are
//! collected in a [`diag::Diagnostics`] value rather than aborting the scan.

use std::error;
use std::fmt;
use std::io;
use std::io::{Read, Seek, SeekFrom};

use log::{debug, info};

pub mod diag;

use diag::{Diagnostics, Warning};

/// A two byte marker code, always beginning with 0xFF.
pub type MarkerCode = [u8; 2];

/// Start of codestream (A.4.1).
pub const MARKER_SOC: MarkerCode = [0xFF, 0x4F];
/// Start of tile-part (A.4.2).
pub const MARKER_SOT: MarkerCode = [0xFF, 0x90];
/// Start of data (A.4.3).
pub const MARKER_SOD: MarkerCode = [0xFF, 0x93];
/// End of codestream (A.4.4).
pub const MARKER_EOC: MarkerCode = [0xFF, 0xD9];
/// Image and tile size (A.5.1).
pub const MARKER_SIZ: MarkerCode = [0xFF, 0x51];
/// Coding style default (A.6.1).
pub const MARKER_COD: MarkerCode = [0xFF, 0x52];
/// Coding style component (A.6.2).
pub const MARKER_COC: MarkerCode = [0xFF, 0x53];
/// Region of interest (A.6.3).
pub const MARKER_RGN: MarkerCode = [0xFF, 0x5E];
/// Quantization default (A.6.4).
pub const MARKER_QCD: MarkerCode = [0xFF, 0x5C];
/// Quantization component (A.6.5).
pub const MARKER_QCC: MarkerCode = [0xFF, 0x5D];
/// Progression order change (A.6.6).
pub const MARKER_POC: MarkerCode = [0xFF, 0x5F];
/// Tile-part lengths (A.7.1).
pub const MARKER_TLM: MarkerCode = [0xFF, 0x55];
/// Packet length, main header (A.7.2).
pub const MARKER_PLM: MarkerCode = [0xFF, 0x57];
/// Packet length, tile-part header (A.7.3).
pub const MARKER_PLT: MarkerCode = [0xFF, 0x58];
/// Packed packet headers, main header (A.7.4).
pub const MARKER_PPM: MarkerCode = [0xFF, 0x60];
/// Packed packet headers, tile-part header (A.7.5).
pub const MARKER_PPT: MarkerCode = [0xFF, 0x61];
/// Component registration (A.9.1).
pub const MARKER_CRG: MarkerCode = [0xFF, 0x63];
/// Comment (A.9.2).
pub const MARKER_COM: MarkerCode = [0xFF, 0x64];

/// Any tile grid describing more tiles than this is treated as implausible.
const MAX_TILES: u64 = 65535;

/// Hard failures. Anything recoverable goes through [`diag::Warning`]
/// instead.
#[derive(Debug)]
pub enum CodestreamError {
    /// The stream does not open with an SOC marker.
    NotACodestream { found: [u8; 2], offset: u64 },
    /// A byte pair at a marker position does not begin with 0xFF.
    InvalidMarker { found: [u8; 2], offset: u64 },
    /// A delimiter appeared where the marker grammar forbids it.
    UnexpectedMarker { marker: MarkerCode, offset: u64 },
    /// The stream ended inside a required field.
    Truncated { offset: u64 },
    /// A segment payload is inconsistent with its declared length.
    MalformedSegment {
        marker: MarkerCode,
        offset: u64,
        reason: &'static str,
    },
    Io(io::Error),
}

impl fmt::Display for CodestreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodestreamError::NotACodestream { found, offset } => write!(
                f,
                "expected SOC marker at offset {}, found 0x{:02X}{:02X}",
                offset, found[0], found[1]
            ),
            CodestreamError::InvalidMarker { found, offset } => write!(
                f,
                "invalid marker 0x{:02X}{:02X} at offset {}",
                found[0], found[1], offset
            ),
            CodestreamError::UnexpectedMarker { marker, offset } => write!(
                f,
                "unexpected marker 0x{:02X}{:02X} at offset {}",
                marker[0], marker[1], offset
            ),
            CodestreamError::Truncated { offset } => {
                write!(f, "codestream truncated near offset {}", offset)
            }
            CodestreamError::MalformedSegment {
                marker,
                offset,
                reason,
            } => write!(
                f,
                "malformed 0x{:02X}{:02X} segment at offset {}: {}",
                marker[0], marker[1], offset, reason
            ),
            CodestreamError::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl error::Error for CodestreamError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CodestreamError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CodestreamError {
    fn from(err: io::Error) -> CodestreamError {
        CodestreamError::Io(err)
    }
}

/// Bounded view over one segment's payload bytes.
///
/// Reads that run past the declared segment length fail with
/// [`CodestreamError::MalformedSegment`] carrying the segment's offset.
struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
    marker: MarkerCode,
    offset: u64,
}

impl<'a> Payload<'a> {
    fn new(buf: &'a [u8], marker: MarkerCode, offset: u64) -> Payload<'a> {
        Payload {
            buf,
            pos: 0,
            marker,
            offset,
        }
    }

    fn malformed(&self, reason: &'static str) -> CodestreamError {
        CodestreamError::MalformedSegment {
            marker: self.marker,
            offset: self.offset,
            reason,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodestreamError> {
        if self.remaining() < n {
            return Err(self.malformed("payload shorter than declared length"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn u8(&mut self) -> Result<u8, CodestreamError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodestreamError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodestreamError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Progression order (A.6.1, Table A-16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionOrder {
    LayerResolutionComponentPosition,
    ResolutionLayerComponentPosition,
    ResolutionPositionComponentLayer,
    PositionComponentResolutionLayer,
    ComponentPositionResolutionLayer,
    /// A value outside the five defined orders, retained verbatim.
    Reserved(u8),
}

impl ProgressionOrder {
    pub fn new(value: u8) -> ProgressionOrder {
        match value {
            0 => ProgressionOrder::LayerResolutionComponentPosition,
            1 => ProgressionOrder::ResolutionLayerComponentPosition,
            2 => ProgressionOrder::ResolutionPositionComponentLayer,
            3 => ProgressionOrder::PositionComponentResolutionLayer,
            4 => ProgressionOrder::ComponentPositionResolutionLayer,
            value => ProgressionOrder::Reserved(value),
        }
    }

    pub fn value(&self) -> u8 {
        match self {
            ProgressionOrder::LayerResolutionComponentPosition => 0,
            ProgressionOrder::ResolutionLayerComponentPosition => 1,
            ProgressionOrder::ResolutionPositionComponentLayer => 2,
            ProgressionOrder::PositionComponentResolutionLayer => 3,
            ProgressionOrder::ComponentPositionResolutionLayer => 4,
            ProgressionOrder::Reserved(value) => *value,
        }
    }
}

/// Quantization style, the low five bits of Sqcd/Sqcc (A.6.4, Table A-28).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationStyle {
    /// No quantization, reversible path.
    None,
    /// Scalar quantization, values signalled for the lowest resolution only.
    ScalarDerived,
    /// Scalar quantization, values signalled for every sub-band.
    ScalarExpounded,
    Reserved(u8),
}

impl QuantizationStyle {
    pub fn new(value: u8) -> QuantizationStyle {
        match value & 0x1F {
            0 => QuantizationStyle::None,
            1 => QuantizationStyle::ScalarDerived,
            2 => QuantizationStyle::ScalarExpounded,
            value => QuantizationStyle::Reserved(value),
        }
    }
}

/// Per-component record of the SIZ segment (A.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSiz {
    /// Raw Ssiz byte: bit depth minus one in the low seven bits, sign flag
    /// in the top bit.
    pub ssiz: u8,
    /// Horizontal sample separation on the reference grid.
    pub xrsiz: u8,
    /// Vertical sample separation on the reference grid.
    pub yrsiz: u8,
}

impl ComponentSiz {
    pub fn bit_depth(&self) -> u8 {
        (self.ssiz & 0x7F) + 1
    }

    pub fn is_signed(&self) -> bool {
        self.ssiz & 0x80 != 0
    }
}

/// Image and tile size segment, SIZ (A.5.1).
///
/// Defines the reference grid, the image region on it, the tile grid and
/// the components. Required immediately after SOC in a legal stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizSegment {
    pub rsiz: u16,
    pub xsiz: u32,
    pub ysiz: u32,
    pub xosiz: u32,
    pub yosiz: u32,
    pub xtsiz: u32,
    pub ytsiz: u32,
    pub xtosiz: u32,
    pub ytosiz: u32,
    pub components: Vec<ComponentSiz>,
}

impl SizSegment {
    pub fn num_components(&self) -> u16 {
        self.components.len() as u16
    }

    pub fn image_width(&self) -> u32 {
        self.xsiz.saturating_sub(self.xosiz)
    }

    pub fn image_height(&self) -> u32 {
        self.ysiz.saturating_sub(self.yosiz)
    }

    /// Tiles per row, ceil((Xsiz - XTOsiz) / XTsiz). Zero when the tile
    /// width is zero.
    pub fn num_x_tiles(&self) -> u64 {
        if self.xtsiz == 0 {
            return 0;
        }
        let span = u64::from(self.xsiz.saturating_sub(self.xtosiz));
        (span + u64::from(self.xtsiz) - 1) / u64::from(self.xtsiz)
    }

    /// Tiles per column, ceil((Ysiz - YTOsiz) / YTsiz).
    pub fn num_y_tiles(&self) -> u64 {
        if self.ytsiz == 0 {
            return 0;
        }
        let span = u64::from(self.ysiz.saturating_sub(self.ytosiz));
        (span + u64::from(self.ytsiz) - 1) / u64::from(self.ytsiz)
    }

    pub fn num_tiles(&self) -> u64 {
        self.num_x_tiles() * self.num_y_tiles()
    }

    fn decode(
        p: &mut Payload,
        diagnostics: &mut Diagnostics,
    ) -> Result<SizSegment, CodestreamError> {
        let rsiz = p.u16()?;
        let xsiz = p.u32()?;
        let ysiz = p.u32()?;
        let xosiz = p.u32()?;
        let yosiz = p.u32()?;
        let xtsiz = p.u32()?;
        let ytsiz = p.u32()?;
        let xtosiz = p.u32()?;
        let ytosiz = p.u32()?;
        let csiz = p.u16()?;
        let mut components = Vec::with_capacity(usize::from(csiz));
        for index in 0..csiz {
            let ssiz = p.u8()?;
            let xrsiz = p.u8()?;
            let yrsiz = p.u8()?;
            if xrsiz == 0 || yrsiz == 0 {
                diagnostics.push(Warning::InvalidSubsampling {
                    component: index,
                    dx: xrsiz,
                    dy: yrsiz,
                    offset: p.offset,
                });
            }
            components.push(ComponentSiz { ssiz, xrsiz, yrsiz });
        }
        let siz = SizSegment {
            rsiz,
            xsiz,
            ysiz,
            xosiz,
            yosiz,
            xtsiz,
            ytsiz,
            xtosiz,
            ytosiz,
            components,
        };
        // The raw fields are always retained; an implausible tile grid only
        // warns, nothing is clamped.
        if siz.xtsiz == 0 || siz.ytsiz == 0 || siz.num_tiles() > MAX_TILES {
            diagnostics.push(Warning::InvalidNumberOfTiles {
                num_tiles: siz.num_tiles(),
                offset: p.offset,
            });
        }
        Ok(siz)
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36 + self.components.len() * 3);
        out.extend_from_slice(&self.rsiz.to_be_bytes());
        out.extend_from_slice(&self.xsiz.to_be_bytes());
        out.extend_from_slice(&self.ysiz.to_be_bytes());
        out.extend_from_slice(&self.xosiz.to_be_bytes());
        out.extend_from_slice(&self.yosiz.to_be_bytes());
        out.extend_from_slice(&self.xtsiz.to_be_bytes());
        out.extend_from_slice(&self.ytsiz.to_be_bytes());
        out.extend_from_slice(&self.xtosiz.to_be_bytes());
        out.extend_from_slice(&self.ytosiz.to_be_bytes());
        out.extend_from_slice(&self.num_components().to_be_bytes());
        for component in &self.components {
            out.push(component.ssiz);
            out.push(component.xrsiz);
            out.push(component.yrsiz);
        }
        out
    }
}

/// SPcod/SPcoc coding parameters shared by COD and COC (A.6.1, Table A-15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingParameters {
    pub num_decomposition_levels: u8,
    /// Raw exponent offset; the code-block width is 2^(value + 2).
    pub code_block_width: u8,
    /// Raw exponent offset; the code-block height is 2^(value + 2).
    pub code_block_height: u8,
    pub code_block_style: u8,
    /// 0 for the irreversible 9-7 filter, 1 for the reversible 5-3.
    pub transformation: u8,
    /// One byte per resolution when precincts are signalled: PPx in the low
    /// nibble, PPy in the high nibble.
    pub precinct_sizes: Vec<u8>,
}

impl CodingParameters {
    pub fn num_resolutions(&self) -> u16 {
        u16::from(self.num_decomposition_levels) + 1
    }

    pub fn code_block_width_value(&self) -> u32 {
        1 << (u32::from(self.code_block_width & 0x0F) + 2)
    }

    pub fn code_block_height_value(&self) -> u32 {
        1 << (u32::from(self.code_block_height & 0x0F) + 2)
    }

    pub fn precinct_width(&self, resolution: usize) -> Option<u32> {
        self.precinct_sizes
            .get(resolution)
            .map(|b| 1 << u32::from(b & 0x0F))
    }

    pub fn precinct_height(&self, resolution: usize) -> Option<u32> {
        self.precinct_sizes
            .get(resolution)
            .map(|b| 1 << u32::from(b >> 4))
    }

    /// The SPcod/SPcoc bytes past the decomposition-levels byte may be
    /// absent in degenerate segments; missing fields decode as zero.
    fn decode(
        p: &mut Payload,
        with_precincts: bool,
        diagnostics: &mut Diagnostics,
    ) -> Result<CodingParameters, CodestreamError> {
        let num_decomposition_levels = p.u8()?;
        let num_resolutions = u16::from(num_decomposition_levels) + 1;
        if num_resolutions > 33 {
            diagnostics.push(Warning::InvalidNumberOfResolutions {
                num_resolutions,
                offset: p.offset,
            });
        }
        let code_block_width = if p.remaining() > 0 { p.u8()? } else { 0 };
        let code_block_height = if p.remaining() > 0 { p.u8()? } else { 0 };
        let width_exponent = u32::from(code_block_width & 0x0F) + 2;
        let height_exponent = u32::from(code_block_height & 0x0F) + 2;
        if width_exponent > 10 || height_exponent > 10 || width_exponent + height_exponent > 12 {
            diagnostics.push(Warning::InvalidCodeblockSize {
                width: 1 << width_exponent,
                height: 1 << height_exponent,
                offset: p.offset,
            });
        }
        let code_block_style = if p.remaining() > 0 { p.u8()? } else { 0 };
        let transformation = if p.remaining() > 0 { p.u8()? } else { 0 };
        if transformation > 1 {
            diagnostics.push(Warning::InvalidWaveletTransform {
                value: transformation,
                offset: p.offset,
            });
        }
        let precinct_sizes = if with_precincts {
            let count = usize::from(num_decomposition_levels) + 1;
            let count = count.min(p.remaining());
            p.bytes(count)?.to_vec()
        } else {
            Vec::new()
        };
        Ok(CodingParameters {
            num_decomposition_levels,
            code_block_width,
            code_block_height,
            code_block_style,
            transformation,
            precinct_sizes,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.num_decomposition_levels);
        out.push(self.code_block_width);
        out.push(self.code_block_height);
        out.push(self.code_block_style);
        out.push(self.transformation);
        out.extend_from_slice(&self.precinct_sizes);
    }
}

/// Coding style default segment, COD (A.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodSegment {
    pub scod: u8,
    pub progression_order: ProgressionOrder,
    pub num_layers: u16,
    pub multiple_component_transform: u8,
    pub parameters: CodingParameters,
}

impl CodSegment {
    pub fn has_precincts(&self) -> bool {
        self.scod & 0x01 != 0
    }

    pub fn has_sop(&self) -> bool {
        self.scod & 0x02 != 0
    }

    pub fn has_eph(&self) -> bool {
        self.scod & 0x04 != 0
    }

    pub fn num_resolutions(&self) -> u16 {
        self.parameters.num_resolutions()
    }

    fn decode(
        p: &mut Payload,
        diagnostics: &mut Diagnostics,
    ) -> Result<CodSegment, CodestreamError> {
        let scod = p.u8()?;
        let order = p.u8()?;
        let progression_order = ProgressionOrder::new(order);
        if let ProgressionOrder::Reserved(value) = progression_order {
            diagnostics.push(Warning::InvalidProgressionOrder {
                value,
                offset: p.offset,
            });
        }
        let num_layers = p.u16()?;
        let multiple_component_transform = p.u8()?;
        let parameters = CodingParameters::decode(p, scod & 0x01 != 0, diagnostics)?;
        Ok(CodSegment {
            scod,
            progression_order,
            num_layers,
            multiple_component_transform,
            parameters,
        })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.scod);
        out.push(self.progression_order.value());
        out.extend_from_slice(&self.num_layers.to_be_bytes());
        out.push(self.multiple_component_transform);
        self.parameters.encode_into(&mut out);
        out
    }
}

/// Coding style component segment, COC (A.6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CocSegment {
    pub component: u16,
    pub scoc: u8,
    pub parameters: CodingParameters,
}

impl CocSegment {
    pub fn has_precincts(&self) -> bool {
        self.scoc & 0x01 != 0
    }

    fn decode(
        p: &mut Payload,
        num_components: u16,
        diagnostics: &mut Diagnostics,
    ) -> Result<CocSegment, CodestreamError> {
        let component = decode_component_index(p, num_components)?;
        let scoc = p.u8()?;
        let parameters = CodingParameters::decode(p, scoc & 0x01 != 0, diagnostics)?;
        Ok(CocSegment {
            component,
            scoc,
            parameters,
        })
    }

    fn payload(&self, num_components: u16) -> Vec<u8> {
        let mut out = Vec::new();
        encode_component_index(self.component, num_components, &mut out);
        out.push(self.scoc);
        self.parameters.encode_into(&mut out);
        out
    }
}

/// One quantization step size (A.6.4, Table A-29/A-30).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSize {
    pub exponent: u8,
    /// Always zero for the reversible (no-quantization) style.
    pub mantissa: u16,
}

/// Quantization default segment, QCD (A.6.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcdSegment {
    pub sqcd: u8,
    pub step_sizes: Vec<StepSize>,
}

impl QcdSegment {
    pub fn style(&self) -> QuantizationStyle {
        QuantizationStyle::new(self.sqcd)
    }

    pub fn guard_bits(&self) -> u8 {
        self.sqcd >> 5
    }

    fn decode(p: &mut Payload) -> Result<QcdSegment, CodestreamError> {
        let sqcd = p.u8()?;
        let step_sizes = decode_step_sizes(p, sqcd)?;
        Ok(QcdSegment { sqcd, step_sizes })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.sqcd);
        encode_step_sizes(self.sqcd, &self.step_sizes, &mut out);
        out
    }
}

/// Quantization component segment, QCC (A.6.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QccSegment {
    pub component: u16,
    pub sqcc: u8,
    pub step_sizes: Vec<StepSize>,
}

impl QccSegment {
    pub fn style(&self) -> QuantizationStyle {
        QuantizationStyle::new(self.sqcc)
    }

    pub fn guard_bits(&self) -> u8 {
        self.sqcc >> 5
    }

    fn decode(p: &mut Payload, num_components: u16) -> Result<QccSegment, CodestreamError> {
        let component = decode_component_index(p, num_components)?;
        let sqcc = p.u8()?;
        let step_sizes = decode_step_sizes(p, sqcc)?;
        Ok(QccSegment {
            component,
            sqcc,
            step_sizes,
        })
    }

    fn payload(&self, num_components: u16) -> Vec<u8> {
        let mut out = Vec::new();
        encode_component_index(self.component, num_components, &mut out);
        out.push(self.sqcc);
        encode_step_sizes(self.sqcc, &self.step_sizes, &mut out);
        out
    }
}

fn decode_step_sizes(p: &mut Payload, style_byte: u8) -> Result<Vec<StepSize>, CodestreamError> {
    let mut step_sizes = Vec::new();
    match QuantizationStyle::new(style_byte) {
        QuantizationStyle::None => {
            while p.remaining() > 0 {
                let b = p.u8()?;
                step_sizes.push(StepSize {
                    exponent: b >> 3,
                    mantissa: 0,
                });
            }
        }
        _ => {
            if p.remaining() % 2 != 0 {
                return Err(p.malformed("odd number of quantization value bytes"));
            }
            while p.remaining() > 0 {
                let v = p.u16()?;
                step_sizes.push(StepSize {
                    exponent: (v >> 11) as u8,
                    mantissa: v & 0x07FF,
                });
            }
        }
    }
    Ok(step_sizes)
}

fn encode_step_sizes(style_byte: u8, step_sizes: &[StepSize], out: &mut Vec<u8>) {
    match QuantizationStyle::new(style_byte) {
        QuantizationStyle::None => {
            for step in step_sizes {
                out.push(step.exponent << 3);
            }
        }
        _ => {
            for step in step_sizes {
                let v = (u16::from(step.exponent) << 11) | (step.mantissa & 0x07FF);
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
    }
}

/// Region of interest segment, RGN (A.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgnSegment {
    pub component: u16,
    /// Srgn: 0, the implicit maxshift method, is the only value A.6.3
    /// defines. Other values are kept as read.
    pub style: u8,
    pub shift: u8,
}

impl RgnSegment {
    fn decode(p: &mut Payload, num_components: u16) -> Result<RgnSegment, CodestreamError> {
        let component = decode_component_index(p, num_components)?;
        let style = p.u8()?;
        let shift = p.u8()?;
        Ok(RgnSegment {
            component,
            style,
            shift,
        })
    }

    fn payload(&self, num_components: u16) -> Vec<u8> {
        let mut out = Vec::new();
        encode_component_index(self.component, num_components, &mut out);
        out.push(self.style);
        out.push(self.shift);
        out
    }
}

/// One progression change of a POC segment (A.6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionChange {
    pub resolution_start: u8,
    pub component_start: u16,
    pub layer_end: u16,
    pub resolution_end: u8,
    pub component_end: u16,
    pub progression_order: ProgressionOrder,
}

/// Progression order change segment, POC (A.6.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PocSegment {
    pub changes: Vec<ProgressionChange>,
}

impl PocSegment {
    fn decode(
        p: &mut Payload,
        num_components: u16,
        diagnostics: &mut Diagnostics,
    ) -> Result<PocSegment, CodestreamError> {
        let mut changes = Vec::new();
        while p.remaining() > 0 {
            let resolution_start = p.u8()?;
            let component_start = decode_component_index(p, num_components)?;
            let layer_end = p.u16()?;
            let resolution_end = p.u8()?;
            let component_end = decode_component_index(p, num_components)?;
            let order = p.u8()?;
            let progression_order = ProgressionOrder::new(order);
            if let ProgressionOrder::Reserved(value) = progression_order {
                diagnostics.push(Warning::InvalidProgressionOrder {
                    value,
                    offset: p.offset,
                });
            }
            changes.push(ProgressionChange {
                resolution_start,
                component_start,
                layer_end,
                resolution_end,
                component_end,
                progression_order,
            });
        }
        Ok(PocSegment { changes })
    }

    fn payload(&self, num_components: u16) -> Vec<u8> {
        let mut out = Vec::new();
        for change in &self.changes {
            out.push(change.resolution_start);
            encode_component_index(change.component_start, num_components, &mut out);
            out.extend_from_slice(&change.layer_end.to_be_bytes());
            out.push(change.resolution_end);
            encode_component_index(change.component_end, num_components, &mut out);
            out.push(change.progression_order.value());
        }
        out
    }
}

/// One tile-part length record of a TLM segment (A.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePartLength {
    /// Absent when Stlm signals implicit tile ordering.
    pub tile_index: Option<u16>,
    pub length: u32,
}

/// Tile-part lengths segment, TLM (A.7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlmSegment {
    pub index: u8,
    pub stlm: u8,
    pub tile_parts: Vec<TilePartLength>,
}

impl TlmSegment {
    /// Width of the Ttlm field in bytes: 0, 1 or 2.
    pub fn tile_index_size(&self) -> u8 {
        (self.stlm >> 4) & 0x03
    }

    /// Width of the Ptlm field in bytes: 2 or 4.
    pub fn length_size(&self) -> u8 {
        if self.stlm & 0x40 != 0 {
            4
        } else {
            2
        }
    }

    fn decode(p: &mut Payload) -> Result<TlmSegment, CodestreamError> {
        let index = p.u8()?;
        let stlm = p.u8()?;
        let st = (stlm >> 4) & 0x03;
        if st == 3 {
            return Err(p.malformed("reserved Stlm tile index size"));
        }
        let sp = stlm & 0x40 != 0;
        let mut tile_parts = Vec::new();
        while p.remaining() > 0 {
            let tile_index = match st {
                0 => None,
                1 => Some(u16::from(p.u8()?)),
                _ => Some(p.u16()?),
            };
            let length = if sp { p.u32()? } else { u32::from(p.u16()?) };
            tile_parts.push(TilePartLength { tile_index, length });
        }
        Ok(TlmSegment {
            index,
            stlm,
            tile_parts,
        })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.index);
        out.push(self.stlm);
        for part in &self.tile_parts {
            match self.tile_index_size() {
                0 => {}
                1 => out.push(part.tile_index.unwrap_or(0) as u8),
                _ => out.extend_from_slice(&part.tile_index.unwrap_or(0).to_be_bytes()),
            }
            if self.length_size() == 4 {
                out.extend_from_slice(&part.length.to_be_bytes());
            } else {
                out.extend_from_slice(&(part.length as u16).to_be_bytes());
            }
        }
        out
    }
}

/// Packet length segment in the main header, PLM (A.7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlmSegment {
    pub index: u8,
    pub packet_lengths: Vec<u64>,
}

/// Packet length segment in a tile-part header, PLT (A.7.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PltSegment {
    pub index: u8,
    pub packet_lengths: Vec<u64>,
}

/// Decodes an Iplm/Iplt packet-length list: 7-bit groups accumulate into a
/// value while the top bit of each byte flags continuation.
fn decode_packet_lengths(p: &mut Payload) -> Result<Vec<u64>, CodestreamError> {
    let mut lengths = Vec::new();
    let mut value: u64 = 0;
    let mut continued = false;
    while p.remaining() > 0 {
        let b = p.u8()?;
        value = (value << 7) | u64::from(b & 0x7F);
        continued = b & 0x80 != 0;
        if !continued {
            lengths.push(value);
            value = 0;
        }
    }
    if continued {
        return Err(p.malformed("packet length list ends mid-value"));
    }
    Ok(lengths)
}

fn encode_packet_lengths(lengths: &[u64], out: &mut Vec<u8>) {
    for &value in lengths {
        let mut groups = [0u8; 10];
        let mut count = 0;
        let mut v = value;
        loop {
            groups[count] = (v & 0x7F) as u8;
            count += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        for i in (0..count).rev() {
            let mut b = groups[i];
            if i != 0 {
                b |= 0x80;
            }
            out.push(b);
        }
    }
}

/// Packed packet headers in the main header, PPM (A.7.4). The payload past
/// the index byte is kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpmSegment {
    pub index: u8,
    pub data: Vec<u8>,
}

/// Packed packet headers in a tile-part header, PPT (A.7.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PptSegment {
    pub index: u8,
    pub data: Vec<u8>,
}

/// Component registration segment, CRG (A.9.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrgSegment {
    /// Per-component (Xcrg, Ycrg) registration offsets in 1/65536ths of the
    /// sample separation.
    pub offsets: Vec<(u16, u16)>,
}

impl CrgSegment {
    fn decode(p: &mut Payload) -> Result<CrgSegment, CodestreamError> {
        if p.remaining() % 4 != 0 {
            return Err(p.malformed("registration list not a whole number of pairs"));
        }
        let mut offsets = Vec::with_capacity(p.remaining() / 4);
        while p.remaining() > 0 {
            let x = p.u16()?;
            let y = p.u16()?;
            offsets.push((x, y));
        }
        Ok(CrgSegment { offsets })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.offsets.len() * 4);
        for (x, y) in &self.offsets {
            out.extend_from_slice(&x.to_be_bytes());
            out.extend_from_slice(&y.to_be_bytes());
        }
        out
    }
}

/// Comment segment, COM (A.9.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComSegment {
    /// 0 for binary data, 1 for Latin text.
    pub registration: u16,
    pub data: Vec<u8>,
}

impl ComSegment {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    fn decode(p: &mut Payload) -> Result<ComSegment, CodestreamError> {
        let registration = p.u16()?;
        let data = p.rest().to_vec();
        Ok(ComSegment { registration, data })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.data.len());
        out.extend_from_slice(&self.registration.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Start of tile-part segment, SOT (A.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SotSegment {
    pub tile_index: u16,
    /// Psot: length of the tile-part from the first byte of the SOT marker,
    /// zero when the tile-part runs to EOC.
    pub tile_part_length: u32,
    pub tile_part_index: u8,
    pub num_tile_parts: u8,
}

impl SotSegment {
    fn decode(p: &mut Payload) -> Result<SotSegment, CodestreamError> {
        let tile_index = p.u16()?;
        let tile_part_length = p.u32()?;
        let tile_part_index = p.u8()?;
        let num_tile_parts = p.u8()?;
        Ok(SotSegment {
            tile_index,
            tile_part_length,
            tile_part_index,
            num_tile_parts,
        })
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.tile_index.to_be_bytes());
        out.extend_from_slice(&self.tile_part_length.to_be_bytes());
        out.push(self.tile_part_index);
        out.push(self.num_tile_parts);
        out
    }
}

/// The closed set of marker segment kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentKind {
    StartOfCodestream,
    ImageAndTileSize(SizSegment),
    CodingStyleDefault(CodSegment),
    CodingStyleComponent(CocSegment),
    QuantizationDefault(QcdSegment),
    QuantizationComponent(QccSegment),
    RegionOfInterest(RgnSegment),
    ProgressionOrderChange(PocSegment),
    TilePartLengths(TlmSegment),
    PacketLengthMain(PlmSegment),
    PacketLengthTilePart(PltSegment),
    PackedPacketHeadersMain(PpmSegment),
    PackedPacketHeadersTilePart(PptSegment),
    ComponentRegistration(CrgSegment),
    Comment(ComSegment),
    StartOfTilePart(SotSegment),
    StartOfData,
    EndOfCodestream,
    /// A marker outside the known set; the payload is kept verbatim.
    Unknown { marker: MarkerCode, data: Vec<u8> },
}

impl SegmentKind {
    pub fn marker(&self) -> MarkerCode {
        match self {
            SegmentKind::StartOfCodestream => MARKER_SOC,
            SegmentKind::ImageAndTileSize(_) => MARKER_SIZ,
            SegmentKind::CodingStyleDefault(_) => MARKER_COD,
            SegmentKind::CodingStyleComponent(_) => MARKER_COC,
            SegmentKind::QuantizationDefault(_) => MARKER_QCD,
            SegmentKind::QuantizationComponent(_) => MARKER_QCC,
            SegmentKind::RegionOfInterest(_) => MARKER_RGN,
            SegmentKind::ProgressionOrderChange(_) => MARKER_POC,
            SegmentKind::TilePartLengths(_) => MARKER_TLM,
            SegmentKind::PacketLengthMain(_) => MARKER_PLM,
            SegmentKind::PacketLengthTilePart(_) => MARKER_PLT,
            SegmentKind::PackedPacketHeadersMain(_) => MARKER_PPM,
            SegmentKind::PackedPacketHeadersTilePart(_) => MARKER_PPT,
            SegmentKind::ComponentRegistration(_) => MARKER_CRG,
            SegmentKind::Comment(_) => MARKER_COM,
            SegmentKind::StartOfTilePart(_) => MARKER_SOT,
            SegmentKind::StartOfData => MARKER_SOD,
            SegmentKind::EndOfCodestream => MARKER_EOC,
            SegmentKind::Unknown { marker, .. } => *marker,
        }
    }

    /// True for SOC, SOD and EOC, which carry no length field.
    pub fn is_delimiter(&self) -> bool {
        matches!(
            self,
            SegmentKind::StartOfCodestream
                | SegmentKind::StartOfData
                | SegmentKind::EndOfCodestream
        )
    }

    fn payload(&self, num_components: u16) -> Vec<u8> {
        match self {
            SegmentKind::StartOfCodestream
            | SegmentKind::StartOfData
            | SegmentKind::EndOfCodestream => Vec::new(),
            SegmentKind::ImageAndTileSize(siz) => siz.payload(),
            SegmentKind::CodingStyleDefault(cod) => cod.payload(),
            SegmentKind::CodingStyleComponent(coc) => coc.payload(num_components),
            SegmentKind::QuantizationDefault(qcd) => qcd.payload(),
            SegmentKind::QuantizationComponent(qcc) => qcc.payload(num_components),
            SegmentKind::RegionOfInterest(rgn) => rgn.payload(num_components),
            SegmentKind::ProgressionOrderChange(poc) => poc.payload(num_components),
            SegmentKind::TilePartLengths(tlm) => tlm.payload(),
            SegmentKind::PacketLengthMain(plm) => {
                let mut out = vec![plm.index];
                encode_packet_lengths(&plm.packet_lengths, &mut out);
                out
            }
            SegmentKind::PacketLengthTilePart(plt) => {
                let mut out = vec![plt.index];
                encode_packet_lengths(&plt.packet_lengths, &mut out);
                out
            }
            SegmentKind::PackedPacketHeadersMain(ppm) => {
                let mut out = vec![ppm.index];
                out.extend_from_slice(&ppm.data);
                out
            }
            SegmentKind::PackedPacketHeadersTilePart(ppt) => {
                let mut out = vec![ppt.index];
                out.extend_from_slice(&ppt.data);
                out
            }
            SegmentKind::ComponentRegistration(crg) => crg.payload(),
            SegmentKind::Comment(com) => com.payload(),
            SegmentKind::StartOfTilePart(sot) => sot.payload(),
            SegmentKind::Unknown { data, .. } => data.clone(),
        }
    }
}

/// A marker segment with its position in the stream.
///
/// `length` is the declared segment length (marker excluded, length field
/// included), zero for delimiters.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSegment {
    pub offset: u64,
    pub length: u16,
    pub kind: SegmentKind,
}

impl MarkerSegment {
    /// Serializes the segment with a recomputed length field.
    ///
    /// `num_components` is the Csiz value of the governing SIZ segment; it
    /// selects the one- or two-byte component index form in COC, QCC, RGN
    /// and POC segments.
    pub fn encode<W: io::Write>(&self, num_components: u16, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.kind.marker())?;
        if self.kind.is_delimiter() {
            return Ok(());
        }
        let payload = self.kind.payload(num_components);
        let length = (payload.len() + 2) as u16;
        writer.write_all(&length.to_be_bytes())?;
        writer.write_all(&payload)
    }
}

/// Component indices are one byte when the image has fewer than 257
/// components and two bytes otherwise (A.6.2). Before a SIZ segment has
/// been seen the one byte form is assumed.
fn decode_component_index(p: &mut Payload, num_components: u16) -> Result<u16, CodestreamError> {
    if num_components < 257 {
        Ok(u16::from(p.u8()?))
    } else {
        p.u16()
    }
}

fn encode_component_index(component: u16, num_components: u16, out: &mut Vec<u8>) {
    if num_components < 257 {
        out.push(component as u8);
    } else {
        out.extend_from_slice(&component.to_be_bytes());
    }
}

/// A parsed codestream: the ordered marker segments of the main header and,
/// for full scans, of every tile-part header.
#[derive(Debug, Clone, PartialEq)]
pub struct Codestream {
    segments: Vec<MarkerSegment>,
}

impl Codestream {
    pub fn new(segments: Vec<MarkerSegment>) -> Codestream {
        Codestream { segments }
    }

    pub fn segments(&self) -> &[MarkerSegment] {
        &self.segments
    }

    pub fn siz(&self) -> Option<&SizSegment> {
        self.segments.iter().find_map(|s| match &s.kind {
            SegmentKind::ImageAndTileSize(siz) => Some(siz),
            _ => None,
        })
    }

    pub fn cod(&self) -> Option<&CodSegment> {
        self.segments.iter().find_map(|s| match &s.kind {
            SegmentKind::CodingStyleDefault(cod) => Some(cod),
            _ => None,
        })
    }

    pub fn qcd(&self) -> Option<&QcdSegment> {
        self.segments.iter().find_map(|s| match &s.kind {
            SegmentKind::QuantizationDefault(qcd) => Some(qcd),
            _ => None,
        })
    }

    pub fn comments(&self) -> impl Iterator<Item = &ComSegment> {
        self.segments.iter().filter_map(|s| match &s.kind {
            SegmentKind::Comment(com) => Some(com),
            _ => None,
        })
    }

    pub fn image_width(&self) -> Option<u32> {
        self.siz().map(SizSegment::image_width)
    }

    pub fn image_height(&self) -> Option<u32> {
        self.siz().map(SizSegment::image_height)
    }

    pub fn num_tiles(&self) -> Option<u64> {
        self.siz().map(SizSegment::num_tiles)
    }

    /// Serializes every segment in order. Tile-part bodies skipped during a
    /// scan are not retained, so the output of a scanned stream holds only
    /// its marker segments.
    pub fn encode<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        let num_components = self.siz().map(SizSegment::num_components).unwrap_or(1);
        for segment in &self.segments {
            segment.encode(num_components, writer)?;
        }
        Ok(())
    }
}

fn read_exact_at<R: Read>(reader: &mut R, buf: &mut [u8], offset: u64) -> Result<(), CodestreamError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => CodestreamError::Truncated { offset },
        _ => CodestreamError::Io(err),
    })
}

/// Scans the codestream in `[current position, end)`.
///
/// `end` bounds every read and seek; a codestream embedded in a container
/// box passes the box's end so a runaway tile-part cannot escape its frame.
///
/// In header-only mode the scan stops at the first SOD. In full mode each
/// tile-part's entropy-coded body is skipped using the Psot length from its
/// SOT segment and scanning resumes at the next marker; a Psot of zero means
/// the final tile-part runs to EOC.
///
/// Recoverable anomalies land in `diagnostics`; the caller flushes them once
/// the parse has completed.
pub fn decode_codestream<R: Read + Seek>(
    reader: &mut R,
    end: u64,
    header_only: bool,
    diagnostics: &mut Diagnostics,
) -> Result<Codestream, CodestreamError> {
    let start = reader.seek(SeekFrom::Current(0))?;
    info!("codestream scan start at offset {}", start);

    let mut pos = start;
    if end < pos + 2 {
        return Err(CodestreamError::Truncated { offset: pos });
    }
    let mut marker = [0u8; 2];
    read_exact_at(reader, &mut marker, pos)?;
    if marker != MARKER_SOC {
        return Err(CodestreamError::NotACodestream {
            found: marker,
            offset: pos,
        });
    }
    let mut segments = vec![MarkerSegment {
        offset: pos,
        length: 0,
        kind: SegmentKind::StartOfCodestream,
    }];
    pos += 2;

    // Csiz of the governing SIZ segment; selects component index widths.
    let mut num_components: u16 = 1;
    // Offset and Psot of the tile-part being scanned.
    let mut tile_part: Option<(u64, u32)> = None;

    loop {
        let offset = pos;
        if pos + 2 > end {
            break;
        }
        if reader.read(&mut marker[..1])? == 0 {
            break;
        }
        read_exact_at(reader, &mut marker[1..], offset)?;
        pos += 2;
        if marker[0] != 0xFF {
            return Err(CodestreamError::InvalidMarker {
                found: marker,
                offset,
            });
        }

        if marker == MARKER_EOC {
            debug!("EOC at offset {}", offset);
            segments.push(MarkerSegment {
                offset,
                length: 0,
                kind: SegmentKind::EndOfCodestream,
            });
            break;
        }
        if marker == MARKER_SOC {
            return Err(CodestreamError::UnexpectedMarker { marker, offset });
        }
        if marker == MARKER_SOD {
            debug!("SOD at offset {}", offset);
            segments.push(MarkerSegment {
                offset,
                length: 0,
                kind: SegmentKind::StartOfData,
            });
            if header_only {
                break;
            }
            let (sot_offset, psot) = match tile_part.take() {
                Some(t) => t,
                None => return Err(CodestreamError::UnexpectedMarker { marker, offset }),
            };
            if psot == 0 {
                // Final tile-part runs to EOC; the stream must close with it.
                if end < 2 {
                    return Err(CodestreamError::Truncated { offset });
                }
                let eoc_offset = end - 2;
                reader.seek(SeekFrom::Start(eoc_offset))?;
                read_exact_at(reader, &mut marker, eoc_offset)?;
                if marker != MARKER_EOC {
                    return Err(CodestreamError::Truncated { offset: eoc_offset });
                }
                segments.push(MarkerSegment {
                    offset: eoc_offset,
                    length: 0,
                    kind: SegmentKind::EndOfCodestream,
                });
                break;
            }
            pos = sot_offset + u64::from(psot);
            if pos > end {
                return Err(CodestreamError::Truncated { offset: sot_offset });
            }
            reader.seek(SeekFrom::Start(pos))?;
            continue;
        }

        // Everything else carries a two byte length that includes itself.
        if pos + 2 > end {
            return Err(CodestreamError::Truncated { offset });
        }
        let mut length_bytes = [0u8; 2];
        read_exact_at(reader, &mut length_bytes, offset)?;
        pos += 2;
        let length = u16::from_be_bytes(length_bytes);
        if length < 2 {
            return Err(CodestreamError::MalformedSegment {
                marker,
                offset,
                reason: "declared length shorter than the length field",
            });
        }
        if offset + 2 + u64::from(length) > end {
            return Err(CodestreamError::Truncated { offset });
        }
        let mut payload_bytes = vec![0u8; usize::from(length) - 2];
        read_exact_at(reader, &mut payload_bytes, offset)?;
        pos += u64::from(length) - 2;
        debug!(
            "marker 0x{:02X}{:02X} at offset {}, length {}",
            marker[0], marker[1], offset, length
        );

        let mut p = Payload::new(&payload_bytes, marker, offset);
        let kind = match marker {
            MARKER_SIZ => {
                let siz = SizSegment::decode(&mut p, diagnostics)?;
                num_components = siz.num_components();
                SegmentKind::ImageAndTileSize(siz)
            }
            MARKER_COD => {
                SegmentKind::CodingStyleDefault(CodSegment::decode(&mut p, diagnostics)?)
            }
            MARKER_COC => SegmentKind::CodingStyleComponent(CocSegment::decode(
                &mut p,
                num_components,
                diagnostics,
            )?),
            MARKER_QCD => SegmentKind::QuantizationDefault(QcdSegment::decode(&mut p)?),
            MARKER_QCC => {
                SegmentKind::QuantizationComponent(QccSegment::decode(&mut p, num_components)?)
            }
            MARKER_RGN => {
                SegmentKind::RegionOfInterest(RgnSegment::decode(&mut p, num_components)?)
            }
            MARKER_POC => SegmentKind::ProgressionOrderChange(PocSegment::decode(
                &mut p,
                num_components,
                diagnostics,
            )?),
            MARKER_TLM => SegmentKind::TilePartLengths(TlmSegment::decode(&mut p)?),
            MARKER_PLM => {
                let index = p.u8()?;
                let packet_lengths = decode_packet_lengths(&mut p)?;
                SegmentKind::PacketLengthMain(PlmSegment {
                    index,
                    packet_lengths,
                })
            }
            MARKER_PLT => {
                let index = p.u8()?;
                let packet_lengths = decode_packet_lengths(&mut p)?;
                SegmentKind::PacketLengthTilePart(PltSegment {
                    index,
                    packet_lengths,
                })
            }
            MARKER_PPM => {
                let index = p.u8()?;
                SegmentKind::PackedPacketHeadersMain(PpmSegment {
                    index,
                    data: p.rest().to_vec(),
                })
            }
            MARKER_PPT => {
                let index = p.u8()?;
                SegmentKind::PackedPacketHeadersTilePart(PptSegment {
                    index,
                    data: p.rest().to_vec(),
                })
            }
            MARKER_CRG => SegmentKind::ComponentRegistration(CrgSegment::decode(&mut p)?),
            MARKER_COM => SegmentKind::Comment(ComSegment::decode(&mut p)?),
            MARKER_SOT => {
                let sot = SotSegment::decode(&mut p)?;
                tile_part = Some((offset, sot.tile_part_length));
                SegmentKind::StartOfTilePart(sot)
            }
            _ => {
                diagnostics.push(Warning::UnrecognizedMarker { marker, offset });
                SegmentKind::Unknown {
                    marker,
                    data: payload_bytes.clone(),
                }
            }
        };
        segments.push(MarkerSegment {
            offset,
            length,
            kind,
        });
    }

    info!("codestream scan finish at offset {}", pos);
    Ok(Codestream::new(segments))
}
