use std::io::Cursor;

use jp2::diag::{Diagnostics, Warning};
use jp2::{
    decode_jp2, parse_boxes, BoxKind, Jp2Error, ParseOptions, BOX_CAPTURE_RESOLUTION,
    BOX_CODESTREAM_HEADER, BOX_COLOUR_SPECIFICATION, BOX_COMPOSITING_LAYER_HEADER,
    BOX_CONTIGUOUS_CODESTREAM, BOX_FILE_TYPE, BOX_IMAGE_HEADER, BOX_JP2_HEADER, BOX_PALETTE,
    BOX_RESOLUTION, BOX_SIGNATURE, BOX_XML, COLOURSPACE_SRGB, SIGNATURE_MAGIC,
};
use jpc::SegmentKind;

fn jp2_box(id: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&id);
    out.extend_from_slice(payload);
    out
}

fn marker_segment(marker: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut out = marker.to_vec();
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// SOC, SIZ (2592x1456, 3 components), COD, QCD, one 18 byte tile-part, EOC.
fn minimal_codestream() -> Vec<u8> {
    let mut siz = Vec::new();
    siz.extend_from_slice(&0u16.to_be_bytes());
    siz.extend_from_slice(&2592u32.to_be_bytes());
    siz.extend_from_slice(&1456u32.to_be_bytes());
    siz.extend_from_slice(&0u32.to_be_bytes());
    siz.extend_from_slice(&0u32.to_be_bytes());
    siz.extend_from_slice(&2592u32.to_be_bytes());
    siz.extend_from_slice(&1456u32.to_be_bytes());
    siz.extend_from_slice(&0u32.to_be_bytes());
    siz.extend_from_slice(&0u32.to_be_bytes());
    siz.extend_from_slice(&3u16.to_be_bytes());
    for _ in 0..3 {
        siz.extend_from_slice(&[7, 1, 1]);
    }
    let mut sot = Vec::new();
    sot.extend_from_slice(&0u16.to_be_bytes());
    sot.extend_from_slice(&18u32.to_be_bytes());
    sot.push(0);
    sot.push(1);

    let mut cs = jpc::MARKER_SOC.to_vec();
    cs.extend(marker_segment(jpc::MARKER_SIZ, &siz));
    cs.extend(marker_segment(
        jpc::MARKER_COD,
        &[0x00, 0x00, 0x00, 0x01, 0x00, 0x05, 0x04, 0x04, 0x00, 0x01],
    ));
    cs.extend(marker_segment(jpc::MARKER_QCD, &[0x40, 0x48, 0x50, 0x50]));
    cs.extend(marker_segment(jpc::MARKER_SOT, &sot));
    cs.extend_from_slice(&jpc::MARKER_SOD);
    cs.extend_from_slice(&[0u8; 4]);
    cs.extend_from_slice(&jpc::MARKER_EOC);
    cs
}

fn ihdr_payload(height: u32, width: u32, num_components: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&height.to_be_bytes());
    p.extend_from_slice(&width.to_be_bytes());
    p.extend_from_slice(&num_components.to_be_bytes());
    p.extend_from_slice(&[7, 7, 0, 0]);
    p
}

fn colr_enumerated(colourspace: u32) -> Vec<u8> {
    let mut p = vec![1, 0, 0];
    p.extend_from_slice(&colourspace.to_be_bytes());
    p
}

fn ftyp_payload() -> Vec<u8> {
    let mut p = b"jp2 ".to_vec();
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(b"jp2 ");
    p
}

fn minimal_jp2() -> Vec<u8> {
    let mut header = jp2_box(BOX_IMAGE_HEADER, &ihdr_payload(1456, 2592, 3));
    header.extend(jp2_box(
        BOX_COLOUR_SPECIFICATION,
        &colr_enumerated(COLOURSPACE_SRGB),
    ));

    let mut file = jp2_box(BOX_SIGNATURE, &SIGNATURE_MAGIC);
    file.extend(jp2_box(BOX_FILE_TYPE, &ftyp_payload()));
    file.extend(jp2_box(BOX_JP2_HEADER, &header));
    file.extend(jp2_box(BOX_CONTIGUOUS_CODESTREAM, &minimal_codestream()));
    file
}

fn parse(bytes: &[u8], options: &ParseOptions) -> jp2::Jp2File {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut reader = Cursor::new(bytes.to_vec());
    decode_jp2(&mut reader, options).expect("file should parse")
}

fn parse_err(bytes: &[u8]) -> Jp2Error {
    let mut reader = Cursor::new(bytes.to_vec());
    match decode_jp2(&mut reader, &ParseOptions::default()) {
        Err(err) => err,
        Ok(_) => panic!("parse should have failed"),
    }
}

#[test]
fn test_minimal_file_parses_without_warnings() {
    let bytes = minimal_jp2();
    let file = parse(&bytes, &ParseOptions::default());
    assert!(file.warnings().is_empty());

    let ids: Vec<[u8; 4]> = file.boxes().iter().map(|b| b.id()).collect();
    assert_eq!(
        ids,
        vec![
            BOX_SIGNATURE,
            BOX_FILE_TYPE,
            BOX_JP2_HEADER,
            BOX_CONTIGUOUS_CODESTREAM,
        ]
    );

    let file_type = file.file_type().expect("ftyp expected");
    assert_eq!(file_type.brand, *b"jp2 ");
    assert!(file_type.is_compatible_with(b"jp2 "));

    let header = file.header().expect("jp2h expected");
    assert_eq!(header.len(), 2);
    assert_eq!(header[0].id(), BOX_IMAGE_HEADER);
    assert_eq!(header[1].id(), BOX_COLOUR_SPECIFICATION);

    let ihdr = file.image_header().expect("ihdr expected");
    assert_eq!(ihdr.width, 2592);
    assert_eq!(ihdr.height, 1456);
    assert_eq!(ihdr.num_components, 3);
    assert_eq!(ihdr.bit_depth(), 8);
    assert!(!ihdr.is_signed());
    assert_eq!(ihdr.compression, 7);

    let colr = file.colour_specification().expect("colr expected");
    assert_eq!(colr.method, 1);
    assert_eq!(colr.colourspace, Some(COLOURSPACE_SRGB));
    assert_eq!(colr.icc_profile, None);

    // The default scan stops at the first SOD of the embedded codestream.
    let codestream = file.codestream().expect("codestream expected");
    assert_eq!(codestream.segments().len(), 6);
    assert!(matches!(
        codestream.segments()[5].kind,
        SegmentKind::StartOfData
    ));
    assert_eq!(codestream.image_width(), Some(2592));

    let cs_box = file.codestream_box().expect("jp2c expected");
    assert_eq!(cs_box.span_length, minimal_codestream().len() as u64);
}

#[test]
fn test_full_codestream_option_reaches_eoc() {
    let bytes = minimal_jp2();
    let options = ParseOptions {
        full_codestream: true,
    };
    let file = parse(&bytes, &options);
    let codestream = file.codestream().expect("codestream expected");
    let last = codestream.segments().last().expect("segments expected");
    assert!(matches!(last.kind, SegmentKind::EndOfCodestream));
}

#[test]
fn test_extended_length_box() {
    let payload = b"<doc/>";
    let mut bytes = 1u32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&BOX_XML);
    bytes.extend_from_slice(&((payload.len() + 16) as u64).to_be_bytes());
    bytes.extend_from_slice(payload);

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    assert!(diagnostics.is_empty());
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].length, bytes.len() as u64);
    assert_eq!(boxes[0].kind, BoxKind::Xml(payload.to_vec()));
}

#[test]
fn test_zero_length_final_box_runs_to_the_end() {
    let mut bytes = jp2_box(BOX_XML, b"<first/>");
    let tail_offset = bytes.len() as u64;
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&BOX_XML);
    bytes.extend_from_slice(b"<rest of the file>");

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    assert_eq!(boxes.len(), 2);
    assert_eq!(boxes[1].offset, tail_offset);
    assert_eq!(boxes[1].length, bytes.len() as u64 - tail_offset);
    assert_eq!(boxes[1].kind, BoxKind::Xml(b"<rest of the file>".to_vec()));
}

#[test]
fn test_box_past_the_range_end_keeps_the_partial_tree() {
    let mut bytes = minimal_jp2();
    // A box declaring far more content than the file holds.
    bytes.extend_from_slice(&1000u32.to_be_bytes());
    bytes.extend_from_slice(&BOX_XML);
    bytes.extend_from_slice(b"short");
    let truncated_offset = minimal_jp2().len() as u64;

    let file = parse(&bytes, &ParseOptions::default());
    assert_eq!(file.boxes().len(), 4);
    assert!(matches!(
        file.warnings()[..],
        [Warning::TruncatedBox {
            id: BOX_XML,
            offset,
            ..
        }] if offset == truncated_offset
    ));
}

#[test]
fn test_trailing_bytes_warn() {
    let mut bytes = minimal_jp2();
    bytes.extend_from_slice(&[0u8; 3]);
    let trailing_offset = minimal_jp2().len() as u64;

    let file = parse(&bytes, &ParseOptions::default());
    assert_eq!(file.boxes().len(), 4);
    assert_eq!(
        file.warnings(),
        &[Warning::TrailingBytes {
            offset: trailing_offset,
            length: 3,
        }]
    );
}

#[test]
fn test_unknown_box_is_kept_opaque_with_a_warning() {
    let mut bytes = minimal_jp2();
    bytes.extend(jp2_box(*b"abcd", &[0xDE, 0xAD]));
    let unknown_offset = minimal_jp2().len() as u64;

    let file = parse(&bytes, &ParseOptions::default());
    let unknown = file.boxes().last().expect("boxes expected");
    assert_eq!(
        unknown.kind,
        BoxKind::Unknown {
            id: *b"abcd",
            data: vec![0xDE, 0xAD],
        }
    );
    assert_eq!(
        file.warnings(),
        &[Warning::UnrecognizedBox {
            id: *b"abcd",
            offset: unknown_offset,
        }]
    );
}

#[test]
fn test_wrong_signature_magic_is_a_hard_error() {
    let mut bytes = jp2_box(BOX_SIGNATURE, &[0x0D, 0x0A, 0x87, 0x0B]);
    bytes.extend(jp2_box(BOX_FILE_TYPE, &ftyp_payload()));

    match parse_err(&bytes) {
        Jp2Error::InvalidSignature { magic, offset } => {
            assert_eq!(magic, [0x0D, 0x0A, 0x87, 0x0B]);
            assert_eq!(offset, 0);
        }
        other => panic!("expected InvalidSignature, got {:?}", other),
    }
}

#[test]
fn test_file_not_opening_with_the_signature_box_is_a_hard_error() {
    let bytes = jp2_box(BOX_FILE_TYPE, &ftyp_payload());
    assert!(matches!(
        parse_err(&bytes),
        Jp2Error::NotAJp2File { offset: 0 }
    ));
}

#[test]
fn test_unknown_brand_is_a_hard_error() {
    let mut payload = b"mjp2".to_vec();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(b"jp2 ");
    let mut bytes = jp2_box(BOX_SIGNATURE, &SIGNATURE_MAGIC);
    bytes.extend(jp2_box(BOX_FILE_TYPE, &payload));

    match parse_err(&bytes) {
        Jp2Error::InvalidBrand { brand, .. } => assert_eq!(&brand, b"mjp2"),
        other => panic!("expected InvalidBrand, got {:?}", other),
    }
}

#[test]
fn test_reserved_box_length_is_a_hard_error() {
    let mut bytes = jp2_box(BOX_SIGNATURE, &SIGNATURE_MAGIC);
    let reserved_offset = bytes.len() as u64;
    bytes.extend_from_slice(&3u32.to_be_bytes());
    bytes.extend_from_slice(&BOX_XML);
    bytes.extend_from_slice(&[0u8; 8]);

    match parse_err(&bytes) {
        Jp2Error::ReservedBoxLength { id, length, offset } => {
            assert_eq!(id, BOX_XML);
            assert_eq!(length, 3);
            assert_eq!(offset, reserved_offset);
        }
        other => panic!("expected ReservedBoxLength, got {:?}", other),
    }
}

#[test]
fn test_non_utf8_compatibility_entry_warns() {
    let mut payload = b"jp2 ".to_vec();
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(b"jp2 ");
    payload.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x01]);
    let mut bytes = jp2_box(BOX_SIGNATURE, &SIGNATURE_MAGIC);
    bytes.extend(jp2_box(BOX_FILE_TYPE, &payload));

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    match &boxes[1].kind {
        BoxKind::FileType(ft) => {
            assert_eq!(ft.compatibility.len(), 2);
            assert_eq!(ft.compatibility[1], [0xFF, 0xFE, 0x00, 0x01]);
        }
        other => panic!("expected a file type box, got {:?}", other),
    }
    assert!(matches!(
        diagnostics.warnings()[..],
        [Warning::NonUtf8CompatibilityEntry {
            entry: [0xFF, 0xFE, 0x00, 0x01],
            ..
        }]
    ));
}

#[test]
fn test_short_icc_profile_warns() {
    // Method 2 with a profile whose leading size word overstates the
    // available bytes.
    let mut payload = vec![2, 0, 0];
    payload.extend_from_slice(&100u32.to_be_bytes());
    payload.extend_from_slice(&[0u8; 4]);
    let bytes = jp2_box(BOX_COLOUR_SPECIFICATION, &payload);

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    match &boxes[0].kind {
        BoxKind::ColourSpecification(colr) => {
            assert_eq!(colr.method, 2);
            assert_eq!(colr.colourspace, None);
            assert_eq!(colr.icc_profile.as_ref().map(Vec::len), Some(8));
        }
        other => panic!("expected a colour specification box, got {:?}", other),
    }
    assert!(matches!(
        diagnostics.warnings()[..],
        [Warning::InvalidIccProfileLength {
            declared: 100,
            available: 8,
            ..
        }]
    ));
}

#[test]
fn test_resolution_superbox() {
    let resc = jp2_box(
        BOX_CAPTURE_RESOLUTION,
        &[0x00, 0x48, 0x00, 0x01, 0x00, 0x48, 0x00, 0x01, 0x02, 0x02],
    );
    let bytes = jp2_box(BOX_RESOLUTION, &resc);

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    assert!(diagnostics.is_empty());
    let children = boxes[0].kind.children().expect("res is a superbox");
    match &children[0].kind {
        BoxKind::CaptureResolution(res) => {
            assert_eq!(res.vertical_numerator, 72);
            assert_eq!(res.vertical_denominator, 1);
            assert_eq!(res.vertical_exponent, 2);
            assert!((res.vertical_resolution() - 7200.0).abs() < 1e-9);
            assert!((res.horizontal_resolution() - 7200.0).abs() < 1e-9);
        }
        other => panic!("expected a capture resolution box, got {:?}", other),
    }
}

#[test]
fn test_palette_entries_are_entry_major() {
    // Two entries over three 8-bit columns.
    let mut payload = 2u16.to_be_bytes().to_vec();
    payload.push(3);
    payload.extend_from_slice(&[7, 7, 7]);
    payload.extend_from_slice(&[0x10, 0x20, 0x30]);
    payload.extend_from_slice(&[0x40, 0x50, 0x60]);
    let bytes = jp2_box(BOX_PALETTE, &payload);

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    match &boxes[0].kind {
        BoxKind::Palette(pclr) => {
            assert_eq!(pclr.num_entries(), 2);
            assert_eq!(pclr.num_columns(), 3);
            assert_eq!(pclr.bit_depth(0), Some(8));
            assert_eq!(pclr.entries[0], vec![0x10, 0x20, 0x30]);
            assert_eq!(pclr.entries[1], vec![0x40, 0x50, 0x60]);
        }
        other => panic!("expected a palette box, got {:?}", other),
    }
}

#[test]
fn test_extended_length_overflowing_the_range_is_abandoned() {
    // A valid box first so the hostile box sits at a nonzero position;
    // its 64-bit length would wrap the end position around.
    let mut bytes = jp2_box(BOX_XML, b"<first/>");
    let hostile_offset = bytes.len() as u64;
    bytes.extend_from_slice(&1u32.to_be_bytes());
    bytes.extend_from_slice(&BOX_XML);
    bytes.extend_from_slice(&u64::MAX.to_be_bytes());

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("the walk should stop cleanly");
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].kind, BoxKind::Xml(b"<first/>".to_vec()));
    assert!(matches!(
        diagnostics.warnings()[..],
        [Warning::TruncatedBox {
            id: BOX_XML,
            offset,
            ..
        }] if offset == hostile_offset
    ));
}

#[test]
fn test_jpx_header_superboxes_recurse() {
    let mut bytes = jp2_box(
        BOX_CODESTREAM_HEADER,
        &jp2_box(*b"lbl ", b"stream-0"),
    );
    bytes.extend(jp2_box(
        BOX_COMPOSITING_LAYER_HEADER,
        &jp2_box(*b"lbl ", b"layer-0"),
    ));

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let boxes = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    )
    .expect("boxes should parse");
    assert!(diagnostics.is_empty());
    assert_eq!(boxes.len(), 2);

    let jpch = boxes[0].kind.children().expect("jpch is a superbox");
    assert_eq!(jpch.len(), 1);
    assert_eq!(jpch[0].kind, BoxKind::Label(b"stream-0".to_vec()));

    let jplh = boxes[1].kind.children().expect("jplh is a superbox");
    assert_eq!(jplh[0].kind, BoxKind::Label(b"layer-0".to_vec()));
}

#[test]
fn test_reparsing_the_same_bytes_is_idempotent() {
    let mut bytes = minimal_jp2();
    bytes.extend(jp2_box(*b"abcd", &[0x00]));

    let first = parse(&bytes, &ParseOptions::default());
    let second = parse(&bytes, &ParseOptions::default());
    assert_eq!(first.boxes(), second.boxes());
    assert_eq!(first.warnings(), second.warnings());
    assert_eq!(first.warnings().len(), 1);
}

#[test]
fn test_signed_palette_columns_are_unsupported() {
    let mut payload = 1u16.to_be_bytes().to_vec();
    payload.push(1);
    payload.push(0x87);
    payload.push(0xFF);
    let bytes = jp2_box(BOX_PALETTE, &payload);

    let mut reader = Cursor::new(bytes.clone());
    let mut diagnostics = Diagnostics::new();
    let result = parse_boxes(
        &mut reader,
        0,
        bytes.len() as u64,
        &ParseOptions::default(),
        &mut diagnostics,
    );
    assert!(matches!(
        result,
        Err(Jp2Error::Unsupported {
            detail: "signed palette column",
            ..
        })
    ));
}
