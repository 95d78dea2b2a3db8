//! Network Transport Tests
//!
//! Scripted in-process servers on ephemeral ports exercise:
//! - The primary protocol handshake, requests and close
//! - The legacy MGWSI gateway protocol
//! - Connect, read and timeout failures

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{call, memory_bridge, texts};
use dbx_bridge::DbType;
use dbx_protocol::mgwsi::{decode_size, encode_reply, CHUNK_SIZE_BASE, SIZE_FIELD_LEN};
use dbx_protocol::{decode_arguments, BlockHeader, Command, RequestPrefix, PREFIX_LEN};

fn serve<F>(handler: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handler(stream);
    });
    (port, handle)
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while stream.read(&mut byte).unwrap() == 1 {
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    String::from_utf8(line).unwrap()
}

fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut frame = vec![0u8; PREFIX_LEN];
    stream.read_exact(&mut frame).unwrap();
    let prefix = RequestPrefix::decode(&frame).unwrap();
    let mut rest = vec![0u8; prefix.total_len as usize - PREFIX_LEN];
    stream.read_exact(&mut rest).unwrap();
    frame.extend_from_slice(&rest);
    frame
}

fn data_block(payload: &[u8]) -> Vec<u8> {
    let mut out = BlockHeader::data(payload.len() as u32).encode().to_vec();
    out.extend_from_slice(payload);
    out
}

fn error_block(payload: &[u8]) -> Vec<u8> {
    let mut out = BlockHeader::error(payload.len() as u32).encode().to_vec();
    out.extend_from_slice(payload);
    out
}

fn network_open_args(port: u16, timeout: &str) -> Vec<String> {
    let mut args: Vec<String> = ["yottadb", "", "127.0.0.1", "", "", "", "USER"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args[3] = port.to_string();
    args.extend(["", "", "", "", "", ""].iter().map(|s| s.to_string()));
    args.push(timeout.to_string());
    args
}

fn open_args(args: &[String]) -> Vec<&str> {
    args.iter().map(|s| s.as_str()).collect()
}

// ============================================================================
// Primary Protocol Tests
// ============================================================================

#[test]
fn test_primary_handshake_get_and_close() {
    let (port, server) = serve(|mut stream| {
        assert_eq!(read_line(&mut stream), "dbx1~USER\n");
        stream.write_all(&data_block(b"V1.2.b3")).unwrap();

        let request = read_request(&mut stream);
        let prefix = RequestPrefix::decode(&request).unwrap();
        assert_eq!(prefix.command(), Some(Command::Get));
        let args = decode_arguments(&request, PREFIX_LEN).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].as_str(), "^g");
        assert_eq!(args[1].as_str(), "1");
        stream.write_all(&data_block(b"value")).unwrap();

        let close = read_request(&mut stream);
        let prefix = RequestPrefix::decode(&close).unwrap();
        assert_eq!(prefix.command(), Some(Command::Close));
        stream.write_all(&data_block(b"0")).unwrap();
    });

    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "5");
    let opened = call(&bridge, Command::Open, 0, &open_args(&args));
    assert!(!opened.is_error(), "{}", opened.first_text());
    let h: u32 = opened.first_text().parse().unwrap();

    assert!(bridge.version(h as usize).ends_with("; YottaDB:1.2.b3"));
    let conn = bridge.registry().lookup(h as usize).unwrap();
    let version = conn.version().unwrap();
    assert_eq!((version.major, version.minor, version.build), (1, 2, 3));

    let response = call(&bridge, Command::Get, h, &["^g", "1"]);
    assert!(!response.is_error());
    assert_eq!(texts(&response), vec!["value"]);

    assert_eq!(call(&bridge, Command::Close, h, &[]).status, 0);
    server.join().unwrap();
}

#[test]
fn test_primary_error_block_passes_through() {
    let (port, server) = serve(|mut stream| {
        read_line(&mut stream);
        stream.write_all(&data_block(b"V6.3-004")).unwrap();
        read_request(&mut stream);
        stream.write_all(&error_block(b"Global node is undefined")).unwrap();
    });

    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "5");
    let h: u32 = call(&bridge, Command::Open, 0, &open_args(&args))
        .first_text()
        .parse()
        .unwrap();

    let response = call(&bridge, Command::Get, h, &["^g"]);
    assert!(response.is_error());
    assert_eq!(response.first_text(), "Global node is undefined");
    server.join().unwrap();
}

#[test]
fn test_status_reply_payload_is_consumed() {
    let status_reply = [2u8, 0, 0, 0, 201, b'o', b'k'];
    let (port, server) = serve(move |mut stream| {
        read_line(&mut stream);
        stream.write_all(&data_block(b"V1.2.b3")).unwrap();
        read_request(&mut stream);
        stream.write_all(&status_reply).unwrap();
        read_request(&mut stream);
        stream.write_all(&data_block(b"value")).unwrap();
    });

    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "5");
    let h: u32 = call(&bridge, Command::Open, 0, &open_args(&args))
        .first_text()
        .parse()
        .unwrap();

    let first = call(&bridge, Command::Lock, h, &["^l", "1"]);
    assert_eq!(first.output, status_reply.to_vec());

    let second = call(&bridge, Command::Get, h, &["^g", "1"]);
    assert!(!second.is_error(), "{}", second.first_text());
    assert_eq!(texts(&second), vec!["value"]);
    server.join().unwrap();
}

#[test]
fn test_objects_rejected_before_network() {
    let (port, server) = serve(|mut stream| {
        read_line(&mut stream);
        stream.write_all(&data_block(b"V1.2.b3")).unwrap();
        // The next frame on the wire must be the close, not the class method
        let close = read_request(&mut stream);
        let prefix = RequestPrefix::decode(&close).unwrap();
        assert_eq!(prefix.command(), Some(Command::Close));
        stream.write_all(&data_block(b"0")).unwrap();
    });

    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "5");
    let h: u32 = call(&bridge, Command::Open, 0, &open_args(&args))
        .first_text()
        .parse()
        .unwrap();
    let response = call(&bridge, Command::ClassMethod, h, &["%SYSTEM.OBJ", "Version"]);
    assert_eq!(
        response.first_text(),
        "Cache objects are not available with this platform"
    );
    assert_eq!(call(&bridge, Command::Close, h, &[]).status, 0);
    server.join().unwrap();
}

// ============================================================================
// Failure Tests
// ============================================================================

#[test]
fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "2");
    let response = call(&bridge, Command::Open, 0, &open_args(&args));
    assert!(response.is_error());
    let expected = format!("Connection Error: Cannot Connect to Server (127.0.0.1:{})", port);
    assert!(response.first_text().starts_with(&expected), "{}", response.first_text());
    assert_eq!(bridge.registry().live(), 0);
}

#[test]
fn test_server_closes_during_handshake() {
    let (port, server) = serve(|mut stream| {
        read_line(&mut stream);
    });
    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "5");
    let response = call(&bridge, Command::Open, 0, &open_args(&args));
    server.join().unwrap();
    assert_eq!(
        response.first_text(),
        "TCP Read Error: Server closed the connection without having returned any data"
    );
}

#[test]
fn test_read_timeout() {
    let (port, server) = serve(|mut stream| {
        read_line(&mut stream);
        thread::sleep(Duration::from_millis(2500));
    });
    let (_memory, bridge) = memory_bridge(DbType::YottaDb);
    let args = network_open_args(port, "1");
    let response = call(&bridge, Command::Open, 0, &open_args(&args));
    assert_eq!(
        response.first_text(),
        "TCP Read Error: Server did not respond within the timeout period (1 seconds)"
    );
    server.join().unwrap();
}

// ============================================================================
// MGWSI Gateway Tests
// ============================================================================

fn read_gateway_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let line = read_line(stream);
    if line.is_empty() {
        return None;
    }
    let header = line.trim_end_matches('\n');
    let size_at = header.len() - SIZE_FIELD_LEN;
    let body_len = decode_size(header[size_at..].as_bytes(), CHUNK_SIZE_BASE) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).unwrap();
    Some((header.to_string(), body))
}

fn gateway_open_args(port: u16) -> Vec<String> {
    let mut args = network_open_args(port, "5");
    args[0] = "iris".to_string();
    args[11] = "NODE1".to_string();
    args[12] = "m_php zmgwsi".to_string();
    args
}

#[test]
fn test_gateway_get_and_error() {
    let (port, server) = serve(|mut stream| {
        let (header, body) = read_gateway_request(&mut stream).unwrap();
        assert!(header.starts_with("PHPg^P^NODE1#USER#0#5#0#"), "{}", header);
        assert!(header.ends_with("^G^00007"), "{}", header);
        assert_eq!(body, b"\x012^g\x0111");
        stream.write_all(&encode_reply("cc", b"gateway value").unwrap()).unwrap();

        let (header, _) = read_gateway_request(&mut stream).unwrap();
        assert!(header.contains("^D^"));
        stream
            .write_all(&encode_reply("ce", b"<UNDEFINED>%g").unwrap())
            .unwrap();

        assert!(read_gateway_request(&mut stream).is_none());
    });

    let (_memory, bridge) = memory_bridge(DbType::Iris);
    let args = gateway_open_args(port);
    let opened = call(&bridge, Command::Open, 0, &open_args(&args));
    assert!(!opened.is_error(), "{}", opened.first_text());
    let h: u32 = opened.first_text().parse().unwrap();

    assert_eq!(call(&bridge, Command::Get, h, &["^g", "1"]).first_text(), "gateway value");

    let response = call(&bridge, Command::Defined, h, &["^g"]);
    assert!(response.is_error());
    assert_eq!(response.first_text(), "<UNDEFINED>^g");

    assert_eq!(call(&bridge, Command::Close, h, &[]).status, 0);
    server.join().unwrap();
}

#[test]
fn test_gateway_local_operations() {
    let (port, server) = serve(|mut stream| {
        assert!(read_gateway_request(&mut stream).is_none());
    });

    let (_memory, bridge) = memory_bridge(DbType::Iris);
    let args = gateway_open_args(port);
    let h: u32 = call(&bridge, Command::Open, 0, &open_args(&args))
        .first_text()
        .parse()
        .unwrap();

    assert_eq!(call(&bridge, Command::GetNamespace, h, &[]).first_text(), "USER");
    assert_eq!(call(&bridge, Command::SetNamespace, h, &["SAMPLES"]).first_text(), "SAMPLES");
    assert_eq!(call(&bridge, Command::GetNamespace, h, &[]).first_text(), "SAMPLES");

    let response = call(&bridge, Command::Method, h, &["1", "Save"]);
    assert!(response.is_error());
    assert_eq!(response.first_text(), "Not Implemented");

    call(&bridge, Command::Close, h, &[]);
    server.join().unwrap();
}
