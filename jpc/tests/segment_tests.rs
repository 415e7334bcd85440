use std::io::Cursor;

use jpc::diag::Diagnostics;
use jpc::{
    decode_codestream, CodestreamError, SegmentKind, MARKER_COD, MARKER_COM, MARKER_CRG,
    MARKER_EOC, MARKER_PLT, MARKER_POC, MARKER_QCC, MARKER_QCD, MARKER_RGN, MARKER_SIZ,
    MARKER_SOC, MARKER_TLM,
};

fn segment(marker: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut out = marker.to_vec();
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn siz_payload(components: &[(u8, u8, u8)]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&512u32.to_be_bytes());
    p.extend_from_slice(&512u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&512u32.to_be_bytes());
    p.extend_from_slice(&512u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&0u32.to_be_bytes());
    p.extend_from_slice(&(components.len() as u16).to_be_bytes());
    for (ssiz, xrsiz, yrsiz) in components {
        p.push(*ssiz);
        p.push(*xrsiz);
        p.push(*yrsiz);
    }
    p
}

fn parse(bytes: &[u8]) -> jpc::Codestream {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut reader = Cursor::new(bytes.to_vec());
    let mut diagnostics = Diagnostics::new();
    decode_codestream(&mut reader, bytes.len() as u64, true, &mut diagnostics)
        .expect("codestream should parse")
}

fn parse_err(bytes: &[u8]) -> CodestreamError {
    let mut reader = Cursor::new(bytes.to_vec());
    let mut diagnostics = Diagnostics::new();
    match decode_codestream(&mut reader, bytes.len() as u64, true, &mut diagnostics) {
        Err(err) => err,
        Ok(_) => panic!("parse should have failed"),
    }
}

fn round_trip(bytes: &[u8]) {
    let codestream = parse(bytes);
    let mut out = Vec::new();
    codestream.encode(&mut out).expect("encode should succeed");
    assert_eq!(out, bytes);
}

#[test]
fn test_main_header_round_trips_byte_for_byte() {
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(
        MARKER_SIZ,
        &siz_payload(&[(7, 1, 1), (7, 1, 1), (7, 1, 1)]),
    ));
    cs.extend(segment(
        MARKER_COD,
        &[0x00, 0x00, 0x00, 0x01, 0x00, 0x05, 0x04, 0x04, 0x00, 0x01],
    ));
    cs.extend(segment(MARKER_QCD, &[0x40, 0x48, 0x50, 0x50]));
    let mut com = 1u16.to_be_bytes().to_vec();
    com.extend_from_slice(b"round trip");
    cs.extend(segment(MARKER_COM, &com));
    cs.extend_from_slice(&MARKER_EOC);

    round_trip(&cs);
}

#[test]
fn test_cod_with_precinct_sizes_round_trips() {
    // Scod bit 0 set: one precinct byte per resolution follows SPcod.
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_SIZ, &siz_payload(&[(7, 1, 1)])));
    cs.extend(segment(
        MARKER_COD,
        &[0x01, 0x00, 0x00, 0x01, 0x00, 0x02, 0x04, 0x04, 0x00, 0x01, 0x77, 0x88, 0x88],
    ));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    let cod = codestream.cod().expect("COD should be present");
    assert!(cod.has_precincts());
    assert_eq!(cod.parameters.precinct_sizes, vec![0x77, 0x88, 0x88]);
    assert_eq!(cod.parameters.precinct_width(0), Some(128));
    assert_eq!(cod.parameters.precinct_height(1), Some(256));
    assert_eq!(cod.parameters.precinct_width(3), None);

    round_trip(&cs);
}

#[test]
fn test_scalar_quantization_values_round_trip() {
    // Sqcc 0x22: one guard bit, scalar expounded. 0x4A2C splits into
    // exponent 9, mantissa 0x22C.
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_SIZ, &siz_payload(&[(7, 1, 1), (7, 1, 1)])));
    cs.extend(segment(MARKER_QCD, &[0x40, 0x48, 0x50]));
    cs.extend(segment(MARKER_QCC, &[0x01, 0x22, 0x4A, 0x2C, 0x4A, 0x2C]));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    let qcc = codestream
        .segments()
        .iter()
        .find_map(|s| match &s.kind {
            SegmentKind::QuantizationComponent(qcc) => Some(qcc),
            _ => None,
        })
        .expect("QCC should be present");
    assert_eq!(qcc.component, 1);
    assert_eq!(qcc.guard_bits(), 1);
    assert_eq!(qcc.step_sizes.len(), 2);
    assert_eq!(qcc.step_sizes[0].exponent, 9);
    assert_eq!(qcc.step_sizes[0].mantissa, 0x22C);

    round_trip(&cs);
}

#[test]
fn test_odd_scalar_quantization_payload_is_malformed() {
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_QCD, &[0x22, 0x4A, 0x2C, 0x4A]));
    cs.extend_from_slice(&MARKER_EOC);

    match parse_err(&cs) {
        CodestreamError::MalformedSegment { marker, .. } => assert_eq!(marker, MARKER_QCD),
        other => panic!("expected MalformedSegment, got {:?}", other),
    }
}

#[test]
fn test_two_byte_component_indices_past_256_components() {
    // 300 components: COC, QCC, RGN and POC switch to the two byte
    // component index form.
    let components = vec![(7u8, 1u8, 1u8); 300];
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_SIZ, &siz_payload(&components)));
    cs.extend(segment(MARKER_RGN, &[0x01, 0x07, 0x00, 0x05]));
    cs.extend(segment(MARKER_QCC, &[0x01, 0x09, 0x40, 0x48]));
    cs.extend(segment(
        MARKER_POC,
        &[0x00, 0x00, 0x00, 0x00, 0x01, 0x06, 0x01, 0x2C, 0x02],
    ));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    let mut rgn = None;
    let mut qcc = None;
    let mut poc = None;
    for s in codestream.segments() {
        match &s.kind {
            SegmentKind::RegionOfInterest(r) => rgn = Some(r),
            SegmentKind::QuantizationComponent(q) => qcc = Some(q),
            SegmentKind::ProgressionOrderChange(p) => poc = Some(p),
            _ => {}
        }
    }
    let rgn = rgn.expect("RGN should be present");
    assert_eq!(rgn.component, 0x0107);
    assert_eq!(rgn.style, 0);
    assert_eq!(rgn.shift, 5);

    let qcc = qcc.expect("QCC should be present");
    assert_eq!(qcc.component, 0x0109);

    let poc = poc.expect("POC should be present");
    assert_eq!(poc.changes.len(), 1);
    let change = &poc.changes[0];
    assert_eq!(change.resolution_start, 0);
    assert_eq!(change.component_start, 0);
    assert_eq!(change.layer_end, 1);
    assert_eq!(change.resolution_end, 6);
    assert_eq!(change.component_end, 300);
    assert_eq!(change.progression_order.value(), 2);

    round_trip(&cs);
}

#[test]
fn test_tlm_with_one_byte_tile_indices_round_trips() {
    // Stlm 0x10: one byte tile indices, two byte lengths.
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(
        MARKER_TLM,
        &[0x00, 0x10, 0x00, 0x04, 0x57, 0x01, 0x10, 0x23],
    ));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    let tlm = codestream
        .segments()
        .iter()
        .find_map(|s| match &s.kind {
            SegmentKind::TilePartLengths(tlm) => Some(tlm),
            _ => None,
        })
        .expect("TLM should be present");
    assert_eq!(tlm.tile_index_size(), 1);
    assert_eq!(tlm.length_size(), 2);
    assert_eq!(tlm.tile_parts.len(), 2);
    assert_eq!(tlm.tile_parts[0].tile_index, Some(0));
    assert_eq!(tlm.tile_parts[0].length, 0x0457);
    assert_eq!(tlm.tile_parts[1].tile_index, Some(1));
    assert_eq!(tlm.tile_parts[1].length, 0x1023);

    round_trip(&cs);
}

#[test]
fn test_tlm_with_reserved_tile_index_size_is_malformed() {
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_TLM, &[0x00, 0x30, 0x00, 0x04]));
    cs.extend_from_slice(&MARKER_EOC);

    match parse_err(&cs) {
        CodestreamError::MalformedSegment { marker, .. } => assert_eq!(marker, MARKER_TLM),
        other => panic!("expected MalformedSegment, got {:?}", other),
    }
}

#[test]
fn test_multi_byte_packet_lengths_round_trip() {
    // 300000 needs three 7-bit groups: 0x92 0xa7 0x60.
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_PLT, &[0x02, 0x92, 0xA7, 0x60, 0x01]));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    match &codestream.segments()[1].kind {
        SegmentKind::PacketLengthTilePart(plt) => {
            assert_eq!(plt.index, 2);
            assert_eq!(plt.packet_lengths, vec![300_000, 1]);
        }
        other => panic!("expected a PLT segment, got {:?}", other),
    }

    round_trip(&cs);
}

#[test]
fn test_dangling_packet_length_continuation_is_malformed() {
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_PLT, &[0x00, 0x85]));
    cs.extend_from_slice(&MARKER_EOC);

    match parse_err(&cs) {
        CodestreamError::MalformedSegment { marker, .. } => assert_eq!(marker, MARKER_PLT),
        other => panic!("expected MalformedSegment, got {:?}", other),
    }
}

#[test]
fn test_component_registration_round_trips() {
    let mut cs = MARKER_SOC.to_vec();
    cs.extend(segment(MARKER_CRG, &[0x00, 0x01, 0x80, 0x00]));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    match &codestream.segments()[1].kind {
        SegmentKind::ComponentRegistration(crg) => {
            assert_eq!(crg.offsets, vec![(0x0001, 0x8000)]);
        }
        other => panic!("expected a CRG segment, got {:?}", other),
    }

    round_trip(&cs);
}

#[test]
fn test_encode_recomputes_the_length_field() {
    let mut cs = MARKER_SOC.to_vec();
    let mut com = 1u16.to_be_bytes().to_vec();
    com.extend_from_slice(b"four");
    cs.extend(segment(MARKER_COM, &com));
    cs.extend_from_slice(&MARKER_EOC);

    let codestream = parse(&cs);
    let mut out = Vec::new();
    codestream.encode(&mut out).expect("encode should succeed");
    // Lcom covers the length field, the registration and four text bytes.
    assert_eq!(&out[4..6], &[0x00, 0x08]);
}
