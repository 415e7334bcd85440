//! JP2 container parsing and writing (ISO/IEC 15444-1 Annex I).
//!
//! A JP2 file is a sequence of length-prefixed boxes; some boxes nest child
//! boxes and one carries the compressed codestream. This crate parses the
//! box tree into a closed set of typed box kinds, re-serializes it with
//! recomputed lengths, validates the structural rules a writable file must
//! satisfy, and wraps raw codestreams into fresh containers.

use std::error;
use std::fmt;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str;

use log::{debug, info};

pub mod diag;
pub mod validate;

use diag::{Diagnostics, Warning};
pub use validate::{validate_boxes, ValidationError};

/// A four byte box type tag.
pub type BoxId = [u8; 4];

/// JPEG 2000 signature box (I.5.1).
pub const BOX_SIGNATURE: BoxId = *b"jP  ";
/// File type box (I.5.2).
pub const BOX_FILE_TYPE: BoxId = *b"ftyp";
/// JP2 header superbox (I.5.3).
pub const BOX_JP2_HEADER: BoxId = *b"jp2h";
/// Image header box (I.5.3.1).
pub const BOX_IMAGE_HEADER: BoxId = *b"ihdr";
/// Bits per component box (I.5.3.2).
pub const BOX_BITS_PER_COMPONENT: BoxId = *b"bpcc";
/// Colour specification box (I.5.3.3).
pub const BOX_COLOUR_SPECIFICATION: BoxId = *b"colr";
/// Palette box (I.5.3.4).
pub const BOX_PALETTE: BoxId = *b"pclr";
/// Component mapping box (I.5.3.5).
pub const BOX_COMPONENT_MAPPING: BoxId = *b"cmap";
/// Channel definition box (I.5.3.6).
pub const BOX_CHANNEL_DEFINITION: BoxId = *b"cdef";
/// Resolution superbox (I.5.3.7).
pub const BOX_RESOLUTION: BoxId = *b"res ";
/// Capture resolution box (I.5.3.7.1).
pub const BOX_CAPTURE_RESOLUTION: BoxId = *b"resc";
/// Default display resolution box (I.5.3.7.2).
pub const BOX_DEFAULT_DISPLAY_RESOLUTION: BoxId = *b"resd";
/// Contiguous codestream box (I.5.4).
pub const BOX_CONTIGUOUS_CODESTREAM: BoxId = *b"jp2c";
/// Intellectual property box (I.6).
pub const BOX_INTELLECTUAL_PROPERTY: BoxId = *b"jp2i";
/// XML box (I.7.1).
pub const BOX_XML: BoxId = *b"xml ";
/// UUID box (I.7.2).
pub const BOX_UUID: BoxId = *b"uuid";
/// UUID info superbox (I.7.3).
pub const BOX_UUID_INFO: BoxId = *b"uinf";
/// UUID list box (I.7.3.1).
pub const BOX_UUID_LIST: BoxId = *b"ulst";
/// Data entry URL box (I.7.3.2).
pub const BOX_DATA_ENTRY_URL: BoxId = *b"url ";
/// Association superbox (JPX, ISO/IEC 15444-2).
pub const BOX_ASSOCIATION: BoxId = *b"asoc";
/// Codestream header superbox (JPX, ISO/IEC 15444-2).
pub const BOX_CODESTREAM_HEADER: BoxId = *b"jpch";
/// Compositing layer header superbox (JPX, ISO/IEC 15444-2).
pub const BOX_COMPOSITING_LAYER_HEADER: BoxId = *b"jplh";
/// Label box (JPX, ISO/IEC 15444-2).
pub const BOX_LABEL: BoxId = *b"lbl ";

/// Magic content of the signature box.
pub const SIGNATURE_MAGIC: [u8; 4] = [0x0D, 0x0A, 0x87, 0x0A];

/// Brand value for plain JP2 files.
pub const BRAND_JP2: BoxId = *b"jp2 ";
/// Brand value for extended JPX files.
pub const BRAND_JPX: BoxId = *b"jpx ";
/// JPX baseline compatibility entry.
pub const COMPATIBILITY_JPXB: BoxId = *b"jpxb";

/// Enumerated sRGB colourspace (I.5.3.3).
pub const COLOURSPACE_SRGB: u32 = 16;
/// Enumerated greyscale colourspace.
pub const COLOURSPACE_GREYSCALE: u32 = 17;
/// Enumerated sYCC colourspace.
pub const COLOURSPACE_SYCC: u32 = 18;

/// Hard failures of the container layer. Recoverable anomalies go through
/// [`diag::Warning`].
#[derive(Debug)]
pub enum Jp2Error {
    /// The signature box content does not match the magic bytes.
    InvalidSignature { magic: [u8; 4], offset: u64 },
    /// The file does not open with a signature box.
    NotAJp2File { offset: u64 },
    /// A file-type brand outside the supported vocabulary.
    InvalidBrand { brand: BoxId, offset: u64 },
    /// A box length field holding one of the reserved values 2 through 7.
    ReservedBoxLength {
        id: BoxId,
        length: u32,
        offset: u64,
    },
    /// A box payload inconsistent with its declared length.
    MalformedBox {
        id: BoxId,
        offset: u64,
        reason: &'static str,
    },
    /// The source ended inside a required field.
    Truncated { offset: u64 },
    /// A structurally valid construct this crate does not handle.
    Unsupported {
        detail: &'static str,
        offset: u64,
    },
    /// Serializing a codestream box without a source to copy it from.
    CodestreamSourceRequired,
    /// A raw codestream without the SIZ segment needed to build a jacket.
    MissingImageGeometry,
    /// A write-time structural rule violation.
    Validation(ValidationError),
    /// A hard failure inside an embedded codestream.
    Codestream(jpc::CodestreamError),
    Io(io::Error),
}

impl fmt::Display for Jp2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Jp2Error::InvalidSignature { magic, offset } => write!(
                f,
                "invalid signature content {:02X?} at offset {}",
                magic, offset
            ),
            Jp2Error::NotAJp2File { offset } => {
                write!(f, "no signature box at offset {}", offset)
            }
            Jp2Error::InvalidBrand { brand, offset } => write!(
                f,
                "invalid brand {:?} at offset {}",
                String::from_utf8_lossy(brand),
                offset
            ),
            Jp2Error::ReservedBoxLength { id, length, offset } => write!(
                f,
                "reserved length {} on box {:?} at offset {}",
                length,
                String::from_utf8_lossy(id),
                offset
            ),
            Jp2Error::MalformedBox { id, offset, reason } => write!(
                f,
                "malformed box {:?} at offset {}: {}",
                String::from_utf8_lossy(id),
                offset,
                reason
            ),
            Jp2Error::Truncated { offset } => {
                write!(f, "file truncated near offset {}", offset)
            }
            Jp2Error::Unsupported { detail, offset } => {
                write!(f, "unsupported: {} at offset {}", detail, offset)
            }
            Jp2Error::CodestreamSourceRequired => {
                write!(f, "codestream box content must be copied from a source")
            }
            Jp2Error::MissingImageGeometry => {
                write!(f, "codestream carries no SIZ segment")
            }
            Jp2Error::Validation(err) => write!(f, "{}", err),
            Jp2Error::Codestream(err) => write!(f, "{}", err),
            Jp2Error::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl error::Error for Jp2Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Jp2Error::Validation(err) => Some(err),
            Jp2Error::Codestream(err) => Some(err),
            Jp2Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Jp2Error {
    fn from(err: io::Error) -> Jp2Error {
        Jp2Error::Io(err)
    }
}

impl From<ValidationError> for Jp2Error {
    fn from(err: ValidationError) -> Jp2Error {
        Jp2Error::Validation(err)
    }
}

impl From<jpc::CodestreamError> for Jp2Error {
    fn from(err: jpc::CodestreamError) -> Jp2Error {
        Jp2Error::Codestream(err)
    }
}

/// Parse configuration, passed explicitly to every top-level parse.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Scan embedded codestreams through every tile-part header instead of
    /// stopping at the first SOD.
    pub full_codestream: bool,
}

/// File type box content (I.5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeBox {
    pub brand: BoxId,
    pub minor_version: u32,
    pub compatibility: Vec<[u8; 4]>,
}

impl FileTypeBox {
    pub fn is_compatible_with(&self, entry: &[u8; 4]) -> bool {
        self.compatibility.iter().any(|e| e == entry)
    }
}

/// Image header box content (I.5.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeaderBox {
    pub height: u32,
    pub width: u32,
    pub num_components: u16,
    /// Raw descriptor: bit depth minus one in the low seven bits, sign flag
    /// in the top bit; 255 defers to a bits-per-component box.
    pub bits_per_component: u8,
    /// Always 7 for JPEG 2000 codestreams.
    pub compression: u8,
    pub colourspace_unknown: u8,
    pub ip_provided: u8,
}

impl ImageHeaderBox {
    pub fn bit_depth(&self) -> u8 {
        (self.bits_per_component & 0x7F) + 1
    }

    pub fn is_signed(&self) -> bool {
        self.bits_per_component & 0x80 != 0
    }
}

/// Bits per component box content (I.5.3.2), one raw descriptor byte per
/// component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitsPerComponentBox {
    pub bits: Vec<u8>,
}

impl BitsPerComponentBox {
    pub fn bit_depth(&self, component: usize) -> Option<u8> {
        self.bits.get(component).map(|b| (b & 0x7F) + 1)
    }

    pub fn is_signed(&self, component: usize) -> Option<bool> {
        self.bits.get(component).map(|b| b & 0x80 != 0)
    }
}

/// Colour specification box content (I.5.3.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColourSpecificationBox {
    /// 1 enumerated, 2 restricted ICC, 3 full ICC (JPX), 4 vendor.
    pub method: u8,
    pub precedence: u8,
    pub approximation: u8,
    /// Present for the enumerated method.
    pub colourspace: Option<u32>,
    /// Present for the ICC methods; kept as opaque bytes.
    pub icc_profile: Option<Vec<u8>>,
}

/// Palette box content (I.5.3.4).
///
/// `entries` is entry-major: one row per palette entry, one value per
/// column. Signed palette columns are rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteBox {
    /// Raw per-column bit-depth descriptors.
    pub bits: Vec<u8>,
    pub entries: Vec<Vec<u32>>,
}

impl PaletteBox {
    pub fn num_entries(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn num_columns(&self) -> u8 {
        self.bits.len() as u8
    }

    pub fn bit_depth(&self, column: usize) -> Option<u8> {
        self.bits.get(column).map(|b| (b & 0x7F) + 1)
    }
}

/// One record of the component mapping box (I.5.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentMapping {
    pub component: u16,
    /// 0 direct use, 1 palette mapping.
    pub mapping_type: u8,
    pub palette_column: u8,
}

/// Component mapping box content (I.5.3.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMappingBox {
    pub mappings: Vec<ComponentMapping>,
}

/// One record of the channel definition box (I.5.3.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDefinition {
    pub index: u16,
    /// 0 colour, 1 opacity, 2 premultiplied opacity.
    pub channel_type: u16,
    /// 0 associates with the whole image, n with colour channel n.
    pub association: u16,
}

/// Channel definition box content (I.5.3.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDefinitionBox {
    pub channels: Vec<ChannelDefinition>,
}

/// Content shared by the capture and default display resolution boxes
/// (I.5.3.7.1, I.5.3.7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionData {
    pub vertical_numerator: u16,
    pub vertical_denominator: u16,
    pub horizontal_numerator: u16,
    pub horizontal_denominator: u16,
    pub vertical_exponent: i8,
    pub horizontal_exponent: i8,
}

impl ResolutionData {
    /// Grid points per metre, vertically.
    pub fn vertical_resolution(&self) -> f64 {
        f64::from(self.vertical_numerator) / f64::from(self.vertical_denominator)
            * 10f64.powi(i32::from(self.vertical_exponent))
    }

    /// Grid points per metre, horizontally.
    pub fn horizontal_resolution(&self) -> f64 {
        f64::from(self.horizontal_numerator) / f64::from(self.horizontal_denominator)
            * 10f64.powi(i32::from(self.horizontal_exponent))
    }
}

/// Contiguous codestream box content (I.5.4).
///
/// The payload is identified by its byte span in the source; the codestream
/// itself is scanned during a file parse (header-only by default, fully
/// when [`ParseOptions::full_codestream`] is set) and left `None` for
/// hand-built boxes destined for [`wrap`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContiguousCodestreamBox {
    pub span_offset: u64,
    pub span_length: u64,
    pub codestream: Option<jpc::Codestream>,
}

/// UUID box content (I.7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidBox {
    pub uuid: [u8; 16],
    pub data: Vec<u8>,
}

/// UUID list box content (I.7.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidListBox {
    pub uuids: Vec<[u8; 16]>,
}

/// Data entry URL box content (I.7.3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntryUrlBox {
    pub version: u8,
    pub flags: [u8; 3],
    /// Null-terminated location bytes, terminator included when present.
    pub location: Vec<u8>,
}

impl DataEntryUrlBox {
    pub fn url(&self) -> Option<&str> {
        let bytes = match self.location.split_last() {
            Some((0, rest)) => rest,
            _ => &self.location[..],
        };
        str::from_utf8(bytes).ok()
    }
}

/// The closed set of box kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum BoxKind {
    Signature,
    FileType(FileTypeBox),
    Jp2Header(Vec<Jp2Box>),
    ImageHeader(ImageHeaderBox),
    BitsPerComponent(BitsPerComponentBox),
    ColourSpecification(ColourSpecificationBox),
    Palette(PaletteBox),
    ComponentMapping(ComponentMappingBox),
    ChannelDefinition(ChannelDefinitionBox),
    Resolution(Vec<Jp2Box>),
    CaptureResolution(ResolutionData),
    DefaultDisplayResolution(ResolutionData),
    ContiguousCodestream(ContiguousCodestreamBox),
    IntellectualProperty(Vec<u8>),
    Xml(Vec<u8>),
    Uuid(UuidBox),
    UuidInfo(Vec<Jp2Box>),
    UuidList(UuidListBox),
    DataEntryUrl(DataEntryUrlBox),
    Association(Vec<Jp2Box>),
    CodestreamHeader(Vec<Jp2Box>),
    CompositingLayerHeader(Vec<Jp2Box>),
    Label(Vec<u8>),
    /// A box outside the known vocabulary; the payload is kept verbatim.
    Unknown { id: BoxId, data: Vec<u8> },
}

impl BoxKind {
    pub fn id(&self) -> BoxId {
        match self {
            BoxKind::Signature => BOX_SIGNATURE,
            BoxKind::FileType(_) => BOX_FILE_TYPE,
            BoxKind::Jp2Header(_) => BOX_JP2_HEADER,
            BoxKind::ImageHeader(_) => BOX_IMAGE_HEADER,
            BoxKind::BitsPerComponent(_) => BOX_BITS_PER_COMPONENT,
            BoxKind::ColourSpecification(_) => BOX_COLOUR_SPECIFICATION,
            BoxKind::Palette(_) => BOX_PALETTE,
            BoxKind::ComponentMapping(_) => BOX_COMPONENT_MAPPING,
            BoxKind::ChannelDefinition(_) => BOX_CHANNEL_DEFINITION,
            BoxKind::Resolution(_) => BOX_RESOLUTION,
            BoxKind::CaptureResolution(_) => BOX_CAPTURE_RESOLUTION,
            BoxKind::DefaultDisplayResolution(_) => BOX_DEFAULT_DISPLAY_RESOLUTION,
            BoxKind::ContiguousCodestream(_) => BOX_CONTIGUOUS_CODESTREAM,
            BoxKind::IntellectualProperty(_) => BOX_INTELLECTUAL_PROPERTY,
            BoxKind::Xml(_) => BOX_XML,
            BoxKind::Uuid(_) => BOX_UUID,
            BoxKind::UuidInfo(_) => BOX_UUID_INFO,
            BoxKind::UuidList(_) => BOX_UUID_LIST,
            BoxKind::DataEntryUrl(_) => BOX_DATA_ENTRY_URL,
            BoxKind::Association(_) => BOX_ASSOCIATION,
            BoxKind::CodestreamHeader(_) => BOX_CODESTREAM_HEADER,
            BoxKind::CompositingLayerHeader(_) => BOX_COMPOSITING_LAYER_HEADER,
            BoxKind::Label(_) => BOX_LABEL,
            BoxKind::Unknown { id, .. } => *id,
        }
    }

    pub fn children(&self) -> Option<&[Jp2Box]> {
        match self {
            BoxKind::Jp2Header(children)
            | BoxKind::Resolution(children)
            | BoxKind::UuidInfo(children)
            | BoxKind::Association(children)
            | BoxKind::CodestreamHeader(children)
            | BoxKind::CompositingLayerHeader(children) => Some(children),
            _ => None,
        }
    }

    pub fn is_superbox(&self) -> bool {
        self.children().is_some()
    }
}

/// A box with its position in the source.
///
/// `offset` is the byte position of the length field; `length` the total
/// declared box size, zero when the box ran to the end of its range. Both
/// are zero on hand-built boxes and recomputed when writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Jp2Box {
    pub offset: u64,
    pub length: u64,
    pub kind: BoxKind,
}

impl Jp2Box {
    /// A box with no recorded position, as built by hand for writing.
    pub fn new(kind: BoxKind) -> Jp2Box {
        Jp2Box {
            offset: 0,
            length: 0,
            kind,
        }
    }

    pub fn id(&self) -> BoxId {
        self.kind.id()
    }

    /// Serializes the box with a recomputed length, recursing through
    /// superboxes. The 64-bit extended length form is only emitted when the
    /// content cannot be framed by a 32-bit length. Returns the number of
    /// bytes written.
    ///
    /// Codestream boxes cannot be serialized this way; their content lives
    /// in a source file that only [`wrap`] has access to.
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<u64, Jp2Error> {
        let payload = self.payload_bytes()?;
        let header = write_box_header(self.id(), payload.len() as u64, writer)?;
        writer.write_all(&payload)?;
        Ok(header + payload.len() as u64)
    }

    fn payload_bytes(&self) -> Result<Vec<u8>, Jp2Error> {
        let mut out = Vec::new();
        match &self.kind {
            BoxKind::Signature => out.extend_from_slice(&SIGNATURE_MAGIC),
            BoxKind::FileType(ft) => {
                out.extend_from_slice(&ft.brand);
                out.extend_from_slice(&ft.minor_version.to_be_bytes());
                for entry in &ft.compatibility {
                    out.extend_from_slice(entry);
                }
            }
            BoxKind::Jp2Header(children)
            | BoxKind::Resolution(children)
            | BoxKind::UuidInfo(children)
            | BoxKind::Association(children)
            | BoxKind::CodestreamHeader(children)
            | BoxKind::CompositingLayerHeader(children) => {
                for child in children {
                    child.encode(&mut out)?;
                }
            }
            BoxKind::ImageHeader(ihdr) => {
                out.extend_from_slice(&ihdr.height.to_be_bytes());
                out.extend_from_slice(&ihdr.width.to_be_bytes());
                out.extend_from_slice(&ihdr.num_components.to_be_bytes());
                out.push(ihdr.bits_per_component);
                out.push(ihdr.compression);
                out.push(ihdr.colourspace_unknown);
                out.push(ihdr.ip_provided);
            }
            BoxKind::BitsPerComponent(bpcc) => out.extend_from_slice(&bpcc.bits),
            BoxKind::ColourSpecification(colr) => {
                out.push(colr.method);
                out.push(colr.precedence);
                out.push(colr.approximation);
                if let Some(colourspace) = colr.colourspace {
                    out.extend_from_slice(&colourspace.to_be_bytes());
                }
                if let Some(profile) = &colr.icc_profile {
                    out.extend_from_slice(profile);
                }
            }
            BoxKind::Palette(pclr) => {
                out.extend_from_slice(&pclr.num_entries().to_be_bytes());
                out.push(pclr.num_columns());
                out.extend_from_slice(&pclr.bits);
                for entry in &pclr.entries {
                    for (column, value) in entry.iter().enumerate() {
                        match palette_column_width(pclr.bits[column]) {
                            1 => out.push(*value as u8),
                            2 => out.extend_from_slice(&(*value as u16).to_be_bytes()),
                            _ => out.extend_from_slice(&value.to_be_bytes()),
                        }
                    }
                }
            }
            BoxKind::ComponentMapping(cmap) => {
                for mapping in &cmap.mappings {
                    out.extend_from_slice(&mapping.component.to_be_bytes());
                    out.push(mapping.mapping_type);
                    out.push(mapping.palette_column);
                }
            }
            BoxKind::ChannelDefinition(cdef) => {
                out.extend_from_slice(&(cdef.channels.len() as u16).to_be_bytes());
                for channel in &cdef.channels {
                    out.extend_from_slice(&channel.index.to_be_bytes());
                    out.extend_from_slice(&channel.channel_type.to_be_bytes());
                    out.extend_from_slice(&channel.association.to_be_bytes());
                }
            }
            BoxKind::CaptureResolution(res) | BoxKind::DefaultDisplayResolution(res) => {
                out.extend_from_slice(&res.vertical_numerator.to_be_bytes());
                out.extend_from_slice(&res.vertical_denominator.to_be_bytes());
                out.extend_from_slice(&res.horizontal_numerator.to_be_bytes());
                out.extend_from_slice(&res.horizontal_denominator.to_be_bytes());
                out.push(res.vertical_exponent as u8);
                out.push(res.horizontal_exponent as u8);
            }
            BoxKind::ContiguousCodestream(_) => return Err(Jp2Error::CodestreamSourceRequired),
            BoxKind::IntellectualProperty(data)
            | BoxKind::Xml(data)
            | BoxKind::Label(data) => out.extend_from_slice(data),
            BoxKind::Uuid(uuid) => {
                out.extend_from_slice(&uuid.uuid);
                out.extend_from_slice(&uuid.data);
            }
            BoxKind::UuidList(ulst) => {
                out.extend_from_slice(&(ulst.uuids.len() as u16).to_be_bytes());
                for uuid in &ulst.uuids {
                    out.extend_from_slice(uuid);
                }
            }
            BoxKind::DataEntryUrl(url) => {
                out.push(url.version);
                out.extend_from_slice(&url.flags);
                out.extend_from_slice(&url.location);
            }
            BoxKind::Unknown { data, .. } => out.extend_from_slice(data),
        }
        Ok(out)
    }
}

/// Writes a box header, choosing the extended form only when the 32-bit
/// length would overflow. Returns the header size in bytes.
fn write_box_header<W: Write>(id: BoxId, content_length: u64, writer: &mut W) -> io::Result<u64> {
    let total = content_length + 8;
    if total > u64::from(u32::MAX) {
        writer.write_all(&1u32.to_be_bytes())?;
        writer.write_all(&id)?;
        writer.write_all(&(content_length + 16).to_be_bytes())?;
        Ok(16)
    } else {
        writer.write_all(&(total as u32).to_be_bytes())?;
        writer.write_all(&id)?;
        Ok(8)
    }
}

fn palette_column_width(descriptor: u8) -> usize {
    match ((descriptor & 0x7F) as usize + 1 + 7) / 8 {
        1 => 1,
        2 => 2,
        _ => 4,
    }
}

/// Bounded view over one box's payload bytes.
struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
    id: BoxId,
    offset: u64,
}

impl<'a> Payload<'a> {
    fn new(buf: &'a [u8], id: BoxId, offset: u64) -> Payload<'a> {
        Payload {
            buf,
            pos: 0,
            id,
            offset,
        }
    }

    fn malformed(&self, reason: &'static str) -> Jp2Error {
        Jp2Error::MalformedBox {
            id: self.id,
            offset: self.offset,
            reason,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Jp2Error> {
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

    fn u8(&mut self) -> Result<u8, Jp2Error> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Jp2Error> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Jp2Error> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn tag(&mut self) -> Result<[u8; 4], Jp2Error> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }
}

fn decode_signature(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let magic = p.tag()?;
    if magic != SIGNATURE_MAGIC {
        return Err(Jp2Error::InvalidSignature {
            magic,
            offset: p.offset,
        });
    }
    Ok(BoxKind::Signature)
}

fn decode_file_type(p: &mut Payload, diagnostics: &mut Diagnostics) -> Result<BoxKind, Jp2Error> {
    let brand = p.tag()?;
    if brand != BRAND_JP2 && brand != BRAND_JPX {
        return Err(Jp2Error::InvalidBrand {
            brand,
            offset: p.offset,
        });
    }
    let minor_version = p.u32()?;
    if p.remaining() % 4 != 0 {
        return Err(p.malformed("compatibility list not a whole number of entries"));
    }
    let mut compatibility = Vec::with_capacity(p.remaining() / 4);
    while p.remaining() > 0 {
        let entry = p.tag()?;
        if str::from_utf8(&entry).is_err() {
            diagnostics.push(Warning::NonUtf8CompatibilityEntry {
                entry,
                offset: p.offset,
            });
        }
        compatibility.push(entry);
    }
    Ok(BoxKind::FileType(FileTypeBox {
        brand,
        minor_version,
        compatibility,
    }))
}

fn decode_image_header(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let height = p.u32()?;
    let width = p.u32()?;
    let num_components = p.u16()?;
    let bits_per_component = p.u8()?;
    let compression = p.u8()?;
    let colourspace_unknown = p.u8()?;
    let ip_provided = p.u8()?;
    Ok(BoxKind::ImageHeader(ImageHeaderBox {
        height,
        width,
        num_components,
        bits_per_component,
        compression,
        colourspace_unknown,
        ip_provided,
    }))
}

fn decode_colour_specification(
    p: &mut Payload,
    diagnostics: &mut Diagnostics,
) -> Result<BoxKind, Jp2Error> {
    let method = p.u8()?;
    let precedence = p.u8()?;
    let approximation = p.u8()?;
    if method == 0 || method > 4 {
        diagnostics.push(Warning::InvalidColourMethod {
            method,
            offset: p.offset,
        });
    }
    let mut colourspace = None;
    let mut icc_profile = None;
    if method == 1 {
        colourspace = Some(p.u32()?);
    } else {
        let profile = p.rest().to_vec();
        if profile.len() >= 4 {
            // The first word of an ICC profile is its own size.
            let declared = u64::from(u32::from_be_bytes([
                profile[0], profile[1], profile[2], profile[3],
            ]));
            if declared > profile.len() as u64 {
                diagnostics.push(Warning::InvalidIccProfileLength {
                    declared,
                    available: profile.len() as u64,
                    offset: p.offset,
                });
            }
        }
        icc_profile = Some(profile);
    }
    Ok(BoxKind::ColourSpecification(ColourSpecificationBox {
        method,
        precedence,
        approximation,
        colourspace,
        icc_profile,
    }))
}

fn decode_palette(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let num_entries = p.u16()?;
    let num_columns = p.u8()?;
    let mut bits = Vec::with_capacity(usize::from(num_columns));
    for _ in 0..num_columns {
        let descriptor = p.u8()?;
        if descriptor & 0x80 != 0 {
            return Err(Jp2Error::Unsupported {
                detail: "signed palette column",
                offset: p.offset,
            });
        }
        bits.push(descriptor);
    }
    let mut entries = Vec::with_capacity(usize::from(num_entries));
    for _ in 0..num_entries {
        let mut entry = Vec::with_capacity(usize::from(num_columns));
        for &descriptor in &bits {
            let value = match palette_column_width(descriptor) {
                1 => u32::from(p.u8()?),
                2 => u32::from(p.u16()?),
                _ => p.u32()?,
            };
            entry.push(value);
        }
        entries.push(entry);
    }
    Ok(BoxKind::Palette(PaletteBox { bits, entries }))
}

fn decode_component_mapping(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    if p.remaining() % 4 != 0 {
        return Err(p.malformed("mapping list not a whole number of records"));
    }
    let mut mappings = Vec::with_capacity(p.remaining() / 4);
    while p.remaining() > 0 {
        let component = p.u16()?;
        let mapping_type = p.u8()?;
        let palette_column = p.u8()?;
        mappings.push(ComponentMapping {
            component,
            mapping_type,
            palette_column,
        });
    }
    Ok(BoxKind::ComponentMapping(ComponentMappingBox { mappings }))
}

fn decode_channel_definition(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let count = p.u16()?;
    let mut channels = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let index = p.u16()?;
        let channel_type = p.u16()?;
        let association = p.u16()?;
        channels.push(ChannelDefinition {
            index,
            channel_type,
            association,
        });
    }
    Ok(BoxKind::ChannelDefinition(ChannelDefinitionBox { channels }))
}

fn decode_resolution_data(p: &mut Payload) -> Result<ResolutionData, Jp2Error> {
    let vertical_numerator = p.u16()?;
    let vertical_denominator = p.u16()?;
    let horizontal_numerator = p.u16()?;
    let horizontal_denominator = p.u16()?;
    let vertical_exponent = p.u8()? as i8;
    let horizontal_exponent = p.u8()? as i8;
    Ok(ResolutionData {
        vertical_numerator,
        vertical_denominator,
        horizontal_numerator,
        horizontal_denominator,
        vertical_exponent,
        horizontal_exponent,
    })
}

fn decode_uuid(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let bytes = p.bytes(16)?;
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(bytes);
    Ok(BoxKind::Uuid(UuidBox {
        uuid,
        data: p.rest().to_vec(),
    }))
}

fn decode_uuid_list(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let count = p.u16()?;
    let mut uuids = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let bytes = p.bytes(16)?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(bytes);
        uuids.push(uuid);
    }
    Ok(BoxKind::UuidList(UuidListBox { uuids }))
}

fn decode_data_entry_url(p: &mut Payload) -> Result<BoxKind, Jp2Error> {
    let version = p.u8()?;
    let flags_bytes = p.bytes(3)?;
    let flags = [flags_bytes[0], flags_bytes[1], flags_bytes[2]];
    Ok(BoxKind::DataEntryUrl(DataEntryUrlBox {
        version,
        flags,
        location: p.rest().to_vec(),
    }))
}

/// Parses the boxes in `[start, end)`, the range contract every recursive
/// superbox call re-enters with its own bounds.
///
/// A box whose declared extent leaves the range is abandoned with a
/// [`Warning::TruncatedBox`]; the walk stops there because the next sibling
/// position cannot be trusted. Unknown ids are captured opaquely with a
/// [`Warning::UnrecognizedBox`].
pub fn parse_boxes<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    end: u64,
    options: &ParseOptions,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Jp2Box>, Jp2Error> {
    let mut boxes = Vec::new();
    let mut pos = start;
    while pos < end {
        if end - pos < 8 {
            diagnostics.push(Warning::TrailingBytes {
                offset: pos,
                length: end - pos,
            });
            break;
        }
        reader.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        let length_field = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let id = [header[4], header[5], header[6], header[7]];
        let mut header_size: u64 = 8;
        let length = match length_field {
            0 => end - pos,
            1 => {
                if end - pos < 16 {
                    diagnostics.push(Warning::TruncatedBox {
                        id,
                        offset: pos,
                        detail: "range too short for an extended length".to_string(),
                    });
                    break;
                }
                let mut extended = [0u8; 8];
                reader.read_exact(&mut extended)?;
                header_size = 16;
                let xl = u64::from_be_bytes(extended);
                if xl < 16 {
                    return Err(Jp2Error::MalformedBox {
                        id,
                        offset: pos,
                        reason: "extended length shorter than its own header",
                    });
                }
                xl
            }
            2..=7 => {
                return Err(Jp2Error::ReservedBoxLength {
                    id,
                    length: length_field,
                    offset: pos,
                });
            }
            n => u64::from(n),
        };
        if length < header_size {
            return Err(Jp2Error::MalformedBox {
                id,
                offset: pos,
                reason: "declared length shorter than the box header",
            });
        }
        // checked_add: a hostile extended length near u64::MAX must not
        // wrap the end position around.
        let box_end = match pos.checked_add(length) {
            Some(box_end) if box_end <= end => box_end,
            _ => {
                diagnostics.push(Warning::TruncatedBox {
                    id,
                    offset: pos,
                    detail: format!(
                        "declared length {} does not fit the enclosing range ending at {}",
                        length, end
                    ),
                });
                break;
            }
        };
        debug!(
            "box {:?} at offset {}, length {}",
            String::from_utf8_lossy(&id),
            pos,
            length
        );

        let content_start = pos + header_size;
        let content_length = box_end - content_start;
        let kind = match id {
            BOX_JP2_HEADER
            | BOX_RESOLUTION
            | BOX_UUID_INFO
            | BOX_ASSOCIATION
            | BOX_CODESTREAM_HEADER
            | BOX_COMPOSITING_LAYER_HEADER => {
                let children = parse_boxes(reader, content_start, box_end, options, diagnostics)?;
                match id {
                    BOX_JP2_HEADER => BoxKind::Jp2Header(children),
                    BOX_RESOLUTION => BoxKind::Resolution(children),
                    BOX_UUID_INFO => BoxKind::UuidInfo(children),
                    BOX_ASSOCIATION => BoxKind::Association(children),
                    BOX_CODESTREAM_HEADER => BoxKind::CodestreamHeader(children),
                    _ => BoxKind::CompositingLayerHeader(children),
                }
            }
            BOX_CONTIGUOUS_CODESTREAM => {
                reader.seek(SeekFrom::Start(content_start))?;
                let mut codestream_diagnostics = jpc::diag::Diagnostics::new();
                let codestream = jpc::decode_codestream(
                    reader,
                    box_end,
                    !options.full_codestream,
                    &mut codestream_diagnostics,
                )?;
                diagnostics.absorb(&mut codestream_diagnostics);
                BoxKind::ContiguousCodestream(ContiguousCodestreamBox {
                    span_offset: content_start,
                    span_length: content_length,
                    codestream: Some(codestream),
                })
            }
            _ => {
                let mut content = vec![0u8; content_length as usize];
                reader.seek(SeekFrom::Start(content_start))?;
                reader.read_exact(&mut content)?;
                let mut p = Payload::new(&content, id, pos);
                match id {
                    BOX_SIGNATURE => decode_signature(&mut p)?,
                    BOX_FILE_TYPE => decode_file_type(&mut p, diagnostics)?,
                    BOX_IMAGE_HEADER => decode_image_header(&mut p)?,
                    BOX_BITS_PER_COMPONENT => BoxKind::BitsPerComponent(BitsPerComponentBox {
                        bits: p.rest().to_vec(),
                    }),
                    BOX_COLOUR_SPECIFICATION => decode_colour_specification(&mut p, diagnostics)?,
                    BOX_PALETTE => decode_palette(&mut p)?,
                    BOX_COMPONENT_MAPPING => decode_component_mapping(&mut p)?,
                    BOX_CHANNEL_DEFINITION => decode_channel_definition(&mut p)?,
                    BOX_CAPTURE_RESOLUTION => {
                        BoxKind::CaptureResolution(decode_resolution_data(&mut p)?)
                    }
                    BOX_DEFAULT_DISPLAY_RESOLUTION => {
                        BoxKind::DefaultDisplayResolution(decode_resolution_data(&mut p)?)
                    }
                    BOX_INTELLECTUAL_PROPERTY => {
                        BoxKind::IntellectualProperty(p.rest().to_vec())
                    }
                    BOX_XML => BoxKind::Xml(p.rest().to_vec()),
                    BOX_UUID => decode_uuid(&mut p)?,
                    BOX_UUID_LIST => decode_uuid_list(&mut p)?,
                    BOX_DATA_ENTRY_URL => decode_data_entry_url(&mut p)?,
                    BOX_LABEL => BoxKind::Label(p.rest().to_vec()),
                    _ => {
                        diagnostics.push(Warning::UnrecognizedBox { id, offset: pos });
                        BoxKind::Unknown {
                            id,
                            data: p.rest().to_vec(),
                        }
                    }
                }
            }
        };
        boxes.push(Jp2Box {
            offset: pos,
            length,
            kind,
        });
        pos = box_end;
    }
    Ok(boxes)
}

/// A parsed JP2 file: its top-level box tree and the warnings accumulated
/// while parsing it.
#[derive(Debug)]
pub struct Jp2File {
    boxes: Vec<Jp2Box>,
    warnings: Vec<Warning>,
}

impl Jp2File {
    pub fn boxes(&self) -> &[Jp2Box] {
        &self.boxes
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn file_type(&self) -> Option<&FileTypeBox> {
        self.boxes.iter().find_map(|b| match &b.kind {
            BoxKind::FileType(ft) => Some(ft),
            _ => None,
        })
    }

    /// Children of the JP2 header superbox.
    pub fn header(&self) -> Option<&[Jp2Box]> {
        self.boxes.iter().find_map(|b| match &b.kind {
            BoxKind::Jp2Header(children) => Some(children.as_slice()),
            _ => None,
        })
    }

    pub fn image_header(&self) -> Option<&ImageHeaderBox> {
        self.header()?.iter().find_map(|b| match &b.kind {
            BoxKind::ImageHeader(ihdr) => Some(ihdr),
            _ => None,
        })
    }

    pub fn colour_specification(&self) -> Option<&ColourSpecificationBox> {
        self.header()?.iter().find_map(|b| match &b.kind {
            BoxKind::ColourSpecification(colr) => Some(colr),
            _ => None,
        })
    }

    pub fn codestream_box(&self) -> Option<&ContiguousCodestreamBox> {
        self.boxes.iter().find_map(|b| match &b.kind {
            BoxKind::ContiguousCodestream(cs) => Some(cs),
            _ => None,
        })
    }

    pub fn codestream(&self) -> Option<&jpc::Codestream> {
        self.codestream_box()?.codestream.as_ref()
    }
}

/// Parses a JP2 file from the reader's current position to its end.
///
/// The first box must be the signature box and its content must match the
/// magic bytes. Warnings collected across the whole tree, embedded
/// codestream included, are flushed to the log and retained on the returned
/// value.
pub fn decode_jp2<R: Read + Seek>(
    reader: &mut R,
    options: &ParseOptions,
) -> Result<Jp2File, Jp2Error> {
    let start = reader.seek(SeekFrom::Current(0))?;
    let end = reader.seek(SeekFrom::End(0))?;
    info!("jp2 parse start at offset {}, {} bytes", start, end - start);

    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(reader, start, end, options, &mut diagnostics)?;
    match boxes.first() {
        Some(b) if matches!(b.kind, BoxKind::Signature) => {}
        _ => return Err(Jp2Error::NotAJp2File { offset: start }),
    }
    diagnostics.flush();
    info!("jp2 parse finish, {} top-level boxes", boxes.len());
    Ok(Jp2File {
        boxes,
        warnings: diagnostics.take(),
    })
}

/// Validates `boxes` and writes them to `writer`, streaming each codestream
/// box's content from `src` (the file its `span_offset`/`span_length`
/// describe).
///
/// A codestream box carrying a recorded position (a nonzero `offset`, as
/// parsed from an existing container) must land at that same position in
/// the output, otherwise its frame would be inconsistent with the copied
/// content.
pub fn wrap<R: Read + Seek, W: Write>(
    src: &mut R,
    boxes: &[Jp2Box],
    writer: &mut W,
) -> Result<(), Jp2Error> {
    validate_boxes(boxes)?;
    info!("wrapping {} top-level boxes", boxes.len());
    let mut pos: u64 = 0;
    for b in boxes {
        match &b.kind {
            BoxKind::ContiguousCodestream(cs) => {
                if b.offset != 0 && b.offset != pos {
                    return Err(Jp2Error::Validation(ValidationError::BoxOffsetMismatch {
                        declared: b.offset,
                        actual: pos,
                    }));
                }
                pos += write_box_header(BOX_CONTIGUOUS_CODESTREAM, cs.span_length, writer)?;
                src.seek(SeekFrom::Start(cs.span_offset))?;
                let copied = io::copy(&mut src.by_ref().take(cs.span_length), writer)?;
                if copied != cs.span_length {
                    return Err(Jp2Error::Truncated {
                        offset: cs.span_offset + copied,
                    });
                }
                pos += copied;
            }
            _ => {
                pos += b.encode(writer)?;
            }
        }
    }
    Ok(())
}

/// Builds the canonical box list for wrapping a raw codestream: signature,
/// file type, a JP2 header holding the image header and an enumerated
/// colour specification derived from the SIZ segment, and the codestream
/// box spanning `[0, codestream_length)` of the source.
pub fn default_jacket(siz: &jpc::SizSegment, codestream_length: u64) -> Vec<Jp2Box> {
    let colourspace = if siz.num_components() < 3 {
        COLOURSPACE_GREYSCALE
    } else {
        COLOURSPACE_SRGB
    };
    let bits_per_component = siz
        .components
        .first()
        .map(|c| c.ssiz)
        .unwrap_or(7);
    vec![
        Jp2Box::new(BoxKind::Signature),
        Jp2Box::new(BoxKind::FileType(FileTypeBox {
            brand: BRAND_JP2,
            minor_version: 0,
            compatibility: vec![BRAND_JP2],
        })),
        Jp2Box::new(BoxKind::Jp2Header(vec![
            Jp2Box::new(BoxKind::ImageHeader(ImageHeaderBox {
                height: siz.image_height(),
                width: siz.image_width(),
                num_components: siz.num_components(),
                bits_per_component,
                compression: 7,
                colourspace_unknown: 0,
                ip_provided: 0,
            })),
            Jp2Box::new(BoxKind::ColourSpecification(ColourSpecificationBox {
                method: 1,
                precedence: 0,
                approximation: 0,
                colourspace: Some(colourspace),
                icc_profile: None,
            })),
        ])),
        Jp2Box::new(BoxKind::ContiguousCodestream(ContiguousCodestreamBox {
            span_offset: 0,
            span_length: codestream_length,
            codestream: None,
        })),
    ]
}

/// Wraps the raw codestream in `src` into a fresh JP2 container with the
/// default box jacket.
pub fn wrap_codestream<R: Read + Seek, W: Write>(
    src: &mut R,
    writer: &mut W,
) -> Result<(), Jp2Error> {
    let length = src.seek(SeekFrom::End(0))?;
    src.seek(SeekFrom::Start(0))?;
    let mut diagnostics = jpc::diag::Diagnostics::new();
    let codestream = jpc::decode_codestream(src, length, true, &mut diagnostics)?;
    diagnostics.flush();
    let siz = codestream.siz().ok_or(Jp2Error::MissingImageGeometry)?;
    let boxes = default_jacket(siz, length);
    wrap(src, &boxes, writer)
}
