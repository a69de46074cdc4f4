//! End-to-end tests driving `Session::connect` over a real loopback TCP
//! socket against a scripted mock peer, in the style of
//! `rustradio::tcp_source`'s `partials()` test (background-thread
//! `TcpListener`, canned byte playback) rather than `MockTransport`'s
//! in-process queue.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};

use enip_client::codec::{pack_u16, AtomicValue};
use enip_client::config::SessionConfig;
use enip_client::encap::{self, command};
use enip_client::session::{service_code, Session};
use enip_client::{service, CipError};

fn cip_reply(service_code: u8, status: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![service_code | 0x80, 0x00, status, 0x00];
    out.extend_from_slice(data);
    out
}

/// Spawn a background thread that accepts one connection and, for each
/// queued reply, reads exactly one request (24-byte header + body) before
/// writing the reply back. Returns the bound loopback address.
fn spawn_peer(replies: Vec<Vec<u8>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for reply in replies {
            let mut header = [0u8; 24];
            if stream.read_exact(&mut header).is_err() {
                return;
            }
            let length = u16::from_le_bytes([header[2], header[3]]) as usize;
            let mut body = vec![0u8; length];
            if stream.read_exact(&mut body).is_err() {
                return;
            }
            stream.write_all(&reply).unwrap();
        }
    });
    addr
}

fn config_for(addr: SocketAddr) -> SessionConfig {
    SessionConfig::default().with_port(addr.port()).with_timeout_secs(5)
}

/// S1: register_session + forward_open + read_tag happy path, start to
/// finish over a real socket.
#[test]
fn connect_forward_open_and_read_tag_round_trip() {
    let session_handle = 0x1000_0001;
    let mut register_payload = pack_u16(1).to_vec();
    register_payload.extend_from_slice(&pack_u16(0));
    let register_reply = encap::build_message(command::REGISTER_SESSION, session_handle, *b"_enip_cl", &register_payload);

    let forward_open_cip = cip_reply(service_code::FORWARD_OPEN, 0x00, &[0xAA, 0xBB, 0xCC, 0xDD]);
    let forward_open_cpf = encap::build_unconnected_cpf(&forward_open_cip);
    let forward_open_reply = encap::build_message(command::SEND_RR_DATA, session_handle, *b"_enip_cl", &forward_open_cpf);

    let mut read_tag_data = pack_u16(0x00C4).to_vec();
    read_tag_data.extend_from_slice(&42i32.to_le_bytes());
    let read_tag_cip = cip_reply(service_code::READ_TAG, 0x00, &read_tag_data);
    let mut connected_payload = pack_u16(1).to_vec();
    connected_payload.extend_from_slice(&read_tag_cip);
    let read_tag_cpf = encap::build_connected_cpf([0xAA, 0xBB, 0xCC, 0xDD], &connected_payload);
    let read_tag_reply = encap::build_message(command::SEND_UNIT_DATA, session_handle, *b"_enip_cl", &read_tag_cpf);

    let addr = spawn_peer(vec![register_reply, forward_open_reply, read_tag_reply]);
    let mut session = Session::connect("127.0.0.1", config_for(addr)).unwrap();
    assert_eq!(session.handle(), session_handle);
    session.forward_open().unwrap();
    assert!(session.is_connected());

    let value = service::read_tag(&mut session, "Counts").unwrap();
    assert_eq!(value, AtomicValue::Dint(42));
}

/// S2: an encapsulation-level error (non-zero header status) surfaces as
/// `CipError::Encapsulation` and does not panic or hang.
#[test]
fn encapsulation_failure_surfaces_as_error() {
    let failure = encap::EncapHeader {
        command: command::REGISTER_SESSION,
        length: 0,
        session: 0,
        status: 0x65,
        context: *b"_enip_cl",
        options: 0,
    }
    .encode()
    .to_vec();
    // No body bytes follow since length==0.
    let addr = spawn_peer(vec![failure]);
    let err = Session::connect("127.0.0.1", config_for(addr)).unwrap_err();
    assert!(matches!(err, CipError::Encapsulation { status: 0x65 }));
}

/// S3: a registered-but-unconnected session rejects a tag read outright
/// if the lazy `forward_open` retry also fails (peer closes before
/// answering `forward_open`).
#[test]
fn read_tag_without_connection_attempts_lazy_forward_open_and_surfaces_failure() {
    let session_handle = 0x2000_0002;
    let mut register_payload = pack_u16(1).to_vec();
    register_payload.extend_from_slice(&pack_u16(0));
    let register_reply = encap::build_message(command::REGISTER_SESSION, session_handle, *b"_enip_cl", &register_payload);

    // Only the register reply is queued; the peer closes the socket
    // before answering the lazy forward_open that read_tag triggers.
    let addr = spawn_peer(vec![register_reply]);
    let mut session = Session::connect("127.0.0.1", config_for(addr)).unwrap();
    assert!(!session.is_connected());

    let err = service::read_tag(&mut session, "Counts").unwrap_err();
    assert!(matches!(err, CipError::Session(_)));
}

/// S4: `read_array` reassembles a fragmented reply spanning two
/// `Read Tag Fragmented` round trips over the real socket.
#[test]
fn read_array_reassembles_fragments_over_real_socket() {
    let session_handle = 0x3000_0003;
    let mut register_payload = pack_u16(1).to_vec();
    register_payload.extend_from_slice(&pack_u16(0));
    let register_reply = encap::build_message(command::REGISTER_SESSION, session_handle, *b"_enip_cl", &register_payload);

    let forward_open_cip = cip_reply(service_code::FORWARD_OPEN, 0x00, &[0x11, 0x22, 0x33, 0x44]);
    let forward_open_cpf = encap::build_unconnected_cpf(&forward_open_cip);
    let forward_open_reply = encap::build_message(command::SEND_RR_DATA, session_handle, *b"_enip_cl", &forward_open_cpf);

    let values: Vec<i16> = (0..20).collect();
    let mut frag1 = pack_u16(0x00C3).to_vec();
    for v in &values[0..10] {
        frag1.extend_from_slice(&v.to_le_bytes());
    }
    let mut frag2 = pack_u16(0x00C3).to_vec();
    for v in &values[10..20] {
        frag2.extend_from_slice(&v.to_le_bytes());
    }
    let frag1_cip = cip_reply(service_code::READ_TAG_FRAGMENTED, 0x06, &frag1);
    let frag2_cip = cip_reply(service_code::READ_TAG_FRAGMENTED, 0x00, &frag2);

    let mut payload1 = pack_u16(1).to_vec();
    payload1.extend_from_slice(&frag1_cip);
    let reply1 = encap::build_message(
        command::SEND_UNIT_DATA,
        session_handle,
        *b"_enip_cl",
        &encap::build_connected_cpf([0x11, 0x22, 0x33, 0x44], &payload1),
    );

    let mut payload2 = pack_u16(2).to_vec();
    payload2.extend_from_slice(&frag2_cip);
    let reply2 = encap::build_message(
        command::SEND_UNIT_DATA,
        session_handle,
        *b"_enip_cl",
        &encap::build_connected_cpf([0x11, 0x22, 0x33, 0x44], &payload2),
    );

    let addr = spawn_peer(vec![register_reply, forward_open_reply, reply1, reply2]);
    let mut session = Session::connect("127.0.0.1", config_for(addr)).unwrap();
    session.forward_open().unwrap();

    let decoded = service::read_array(&mut session, "Arr", 20).unwrap();
    assert_eq!(decoded.len(), 20);
    assert_eq!(decoded[0], AtomicValue::Int(0));
    assert_eq!(decoded[19], AtomicValue::Int(19));
}
