//! Wire Protocol Tests
//!
//! Tests for:
//! - Block header encoding and sort normalisation
//! - Argument list termination
//! - Request prefixes
//! - MGWSI framing and base-62 sizes

use dbx_protocol::mgwsi::{
    decode_size, encode_reply, encode_size, parse_reply, reply_len, GatewayHeader, GatewayReply,
    GatewayRequest, ItemType,
};
use dbx_protocol::{
    decode_arguments, decode_blocks, encode_block, BlockHeader, Buffer, Command, DataType,
    RequestBuilder, RequestPrefix, Sort, HEADER_LEN, MAX_ARGS, PREFIX_LEN,
};

// ============================================================================
// Block Header Tests
// ============================================================================

#[test]
fn test_header_round_trip() {
    let sorts = [Sort::Data, Sort::Subscript, Sort::Global, Sort::Error];
    let types = [
        DataType::DbxStr,
        DataType::Str,
        DataType::Int,
        DataType::Int64,
        DataType::Double,
        DataType::Oref,
        DataType::Null,
    ];
    for sort in sorts {
        for data_type in types {
            for len in [0u32, 1, 255, 65_536, u32::MAX] {
                let header = BlockHeader::new(len, sort, data_type);
                assert_eq!(BlockHeader::decode(header.encode()), header);
            }
        }
    }
}

#[test]
fn test_unknown_sort_is_invalid() {
    for tag in [4u8 * 20 + 1, 5 * 20, 8 * 20 + 2, 12 * 20 + 1] {
        let header = BlockHeader::decode([3, 0, 0, 0, tag]);
        assert_eq!(header.sort, Sort::Invalid, "tag {}", tag);
    }
}

#[test]
fn test_status_block_has_no_length() {
    let header = BlockHeader::decode([9, 9, 0, 0, 10 * 20 + 1]);
    assert_eq!(header.sort, Sort::Status);
    assert_eq!(header.len, 0);
}

#[test]
fn test_response_tags() {
    assert_eq!(BlockHeader::data(0).tag(), 21);
    assert_eq!(BlockHeader::error(0).tag(), 221);
}

// ============================================================================
// Argument List Tests
// ============================================================================

#[test]
fn test_arguments_stop_at_eod() {
    let frame = RequestBuilder::new(Command::Set, 0)
        .arg("^g")
        .arg("1")
        .arg("value")
        .build()
        .unwrap();
    let mut with_trailer = frame.clone();
    with_trailer.extend_from_slice(&BlockHeader::data(3).encode());
    with_trailer.extend_from_slice(b"xyz");
    with_trailer.extend_from_slice(&[0xff; 17]);

    for input in [&frame, &with_trailer] {
        let args = decode_arguments(input, PREFIX_LEN).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[2].as_str(), "value");
        assert_eq!(args[0].data_type, DataType::Str);
    }
}

#[test]
fn test_arguments_are_capped() {
    let builder = (0..MAX_ARGS + 10).fold(RequestBuilder::new(Command::Function, 0), |b, n| {
        b.arg(n.to_string())
    });
    let frame = builder.build().unwrap();
    let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
    assert_eq!(args.len(), MAX_ARGS);
}

#[test]
fn test_arguments_borrow_input() {
    let frame = RequestBuilder::new(Command::Get, 0).arg("^g").build().unwrap();
    let args = decode_arguments(&frame, PREFIX_LEN).unwrap();
    let start = frame.as_ptr() as usize;
    let arg = args[0].bytes.as_ptr() as usize;
    assert_eq!(arg - start, PREFIX_LEN + HEADER_LEN);
}

#[test]
fn test_truncated_argument() {
    let mut frame = RequestBuilder::new(Command::Get, 0).arg("^global").build().unwrap();
    frame.truncate(PREFIX_LEN + HEADER_LEN + 3);
    assert!(decode_arguments(&frame, PREFIX_LEN).is_err());
}

// ============================================================================
// Request Prefix Tests
// ============================================================================

#[test]
fn test_request_prefix() {
    let frame = RequestBuilder::new(Command::Increment, 7)
        .output_size(4096)
        .arg("^n")
        .double_arg(1.5)
        .build()
        .unwrap();
    let prefix = RequestPrefix::decode(&frame).unwrap();
    assert_eq!(prefix.total_len as usize, frame.len());
    assert_eq!(prefix.output_size, 4096);
    assert_eq!(prefix.handle, 7);
    assert_eq!(prefix.command(), Some(Command::Increment));
    assert!(RequestPrefix::decode(&frame[..10]).is_err());
}

#[test]
fn test_response_blocks() {
    let mut out = Buffer::new(16, 16);
    encode_block(&mut out, b"first", Sort::Data, DataType::DbxStr).unwrap();
    encode_block(&mut out, b"second", Sort::Data, DataType::DbxStr).unwrap();
    assert_eq!(out.capacity(), 32);

    let blocks = decode_blocks(out.as_slice()).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].as_str(), "second");
    assert!(!blocks[0].is_error());
}

// ============================================================================
// MGWSI Tests
// ============================================================================

fn gateway_header() -> GatewayHeader {
    GatewayHeader {
        product: "g".to_string(),
        server: "LOCAL".to_string(),
        uci: "USER".to_string(),
        timeout: 30,
        no_retry: false,
        version: "0.9.0".to_string(),
        storage_mode: 0,
    }
}

#[test]
fn test_base62_round_trip() {
    let mut n = 0u64;
    while n <= 1_000_000_000 {
        assert_eq!(decode_size(encode_size(n, 62).as_bytes(), 62), n);
        n = n * 7 + 13;
    }
    assert_eq!(encode_size(1_000_000_000, 62).len(), 6);
    assert_eq!(encode_size(916_132_831, 62), "zzzzz");
}

#[test]
fn test_gateway_request_frame() {
    let mut request = GatewayRequest::new(&gateway_header(), "G");
    request.add(b"^g", false, ItemType::Data).unwrap();
    request.add(b"1", false, ItemType::Data).unwrap();
    let frame = request.finish().unwrap();
    let text = String::from_utf8(frame).unwrap();

    let (header, body) = text.split_once('\n').unwrap();
    assert_eq!(header, "PHPg^P^LOCAL#USER#0#30#0#0.9.0#0^G^00007");
    assert_eq!(body.as_bytes(), b"\x012^g\x0111");
}

#[test]
fn test_gateway_replies() {
    let data = encode_reply("cc", b"hello").unwrap();
    assert_eq!(&data[..8], b"00005cc\n");
    assert_eq!(reply_len(&data), Some(13));
    assert_eq!(reply_len(&data[..4]), None);
    assert_eq!(parse_reply(&data), GatewayReply::Data(b"hello".to_vec()));

    let error = encode_reply("ce", b"<UNDEFINED>x%g").unwrap();
    assert_eq!(
        parse_reply(&error),
        GatewayReply::Error("<UNDEFINED>x^g".to_string())
    );
}
