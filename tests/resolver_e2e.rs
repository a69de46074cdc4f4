//! End-to-end metadata resolution: enumerate the symbol table, fetch one
//! structure's template, and materialize the flat tag list, all over a
//! real loopback socket against a scripted mock peer.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};

use enip_client::codec::{pack_u16, pack_u32};
use enip_client::config::SessionConfig;
use enip_client::encap::{self, command};
use enip_client::resolver::{self, TemplateCache};
use enip_client::session::{service_code, Session};
use enip_client::{TagType, TemplateMember};

fn cip_reply(service_code: u8, status: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![service_code | 0x80, 0x00, status, 0x00];
    out.extend_from_slice(data);
    out
}

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

fn unit_data_reply(session_handle: u32, seq: u16, target_cid: [u8; 4], cip_data: &[u8]) -> Vec<u8> {
    let mut connected_payload = pack_u16(seq).to_vec();
    connected_payload.extend_from_slice(cip_data);
    let cpf = encap::build_connected_cpf(target_cid, &connected_payload);
    encap::build_message(command::SEND_UNIT_DATA, session_handle, *b"_enip_cl", &cpf)
}

/// S5/S6: `get_tag_list` enumerates one atomic tag and one struct tag,
/// the struct's template is fetched via `get_tag_struct`/`read_template`,
/// and `build_tag_tree` flattens the result into a `Val` member tag
/// addressed as `MyStruct.Val`. The session is only `register_session`'d
/// before the call, exercising `get_tag_list`'s lazy `forward_open`.
#[test]
fn build_tag_tree_resolves_struct_member() {
    let session_handle = 0x4000_0004;
    let target_cid = [9, 9, 9, 9];

    let mut register_payload = pack_u16(1).to_vec();
    register_payload.extend_from_slice(&pack_u16(0));
    let register_reply = encap::build_message(command::REGISTER_SESSION, session_handle, *b"_enip_cl", &register_payload);

    let forward_open_cip = cip_reply(service_code::FORWARD_OPEN, 0x00, &target_cid);
    let forward_open_cpf = encap::build_unconnected_cpf(&forward_open_cip);
    let forward_open_reply = encap::build_message(command::SEND_RR_DATA, session_handle, *b"_enip_cl", &forward_open_cpf);

    // get_tag_list: two entries, "Counts" (atomic DINT) and "MyStruct"
    // (structured, template id 5).
    let mut tag_list_data = Vec::new();
    tag_list_data.extend_from_slice(&pack_u32(1));
    tag_list_data.extend_from_slice(&pack_u16(6));
    tag_list_data.extend_from_slice(b"Counts");
    tag_list_data.extend_from_slice(&pack_u16(0x00C4));
    tag_list_data.extend_from_slice(&pack_u32(2));
    tag_list_data.extend_from_slice(&pack_u16(8));
    tag_list_data.extend_from_slice(b"MyStruct");
    tag_list_data.extend_from_slice(&pack_u16(0x8005));
    let tag_list_cip = cip_reply(service_code::GET_INSTANCE_ATTRIBUTE_LIST, 0x00, &tag_list_data);
    let tag_list_reply = unit_data_reply(session_handle, 1, target_cid, &tag_list_cip);

    // get_tag_struct(template=5): obj_def_size=11, struct_size=4,
    // member_cnt=1, struct_handle=0x1234.
    let mut attr_data = pack_u16(4).to_vec();
    attr_data.extend_from_slice(&pack_u16(4));
    attr_data.extend_from_slice(&pack_u16(0));
    attr_data.extend_from_slice(&pack_u32(11));
    attr_data.extend_from_slice(&pack_u16(5));
    attr_data.extend_from_slice(&pack_u16(0));
    attr_data.extend_from_slice(&pack_u32(4));
    attr_data.extend_from_slice(&pack_u16(2));
    attr_data.extend_from_slice(&pack_u16(0));
    attr_data.extend_from_slice(&pack_u16(1));
    attr_data.extend_from_slice(&pack_u16(1));
    attr_data.extend_from_slice(&pack_u16(0));
    attr_data.extend_from_slice(&pack_u16(0x1234));
    let attr_cip = cip_reply(service_code::GET_ATTRIBUTE_LIST, 0x00, &attr_data);
    let attr_reply = unit_data_reply(session_handle, 2, target_cid, &attr_cip);

    // read_template(template=5): one DINT member "Val" at offset 0, name
    // table "MyStruct\0Val\0".
    let mut template_data = Vec::new();
    template_data.extend_from_slice(&pack_u16(0)); // info
    template_data.extend_from_slice(&pack_u16(0x00C4)); // symbol type: atomic DINT
    template_data.extend_from_slice(&pack_u32(0)); // offset
    template_data.extend_from_slice(b"MyStruct\0Val\0");
    let template_cip = cip_reply(service_code::READ_TAG, 0x00, &template_data);
    let template_reply = unit_data_reply(session_handle, 3, target_cid, &template_cip);

    let addr = spawn_peer(vec![register_reply, forward_open_reply, tag_list_reply, attr_reply, template_reply]);
    let mut session = Session::connect("127.0.0.1", config_for(addr)).unwrap();
    assert!(!session.is_connected());

    // No manual forward_open: get_tag_list's ensure_connected guard opens
    // the connection lazily on the session's first resolver call.
    let mut cache = TemplateCache::new();
    let tags = resolver::build_tag_tree(&mut session, &mut cache).unwrap();

    let counts = tags.iter().find(|t| t.full_name == "Counts").expect("Counts tag present");
    assert_eq!(counts.tag_type, TagType::Atomic);
    assert_eq!(counts.data_type, 0xC4);

    let my_struct = tags.iter().find(|t| t.full_name == "MyStruct").expect("MyStruct tag present");
    assert_eq!(my_struct.tag_type, TagType::Struct);
    let members = my_struct.members.as_ref().unwrap();
    assert_eq!(members, &vec![TemplateMember {
        name: "Val".into(),
        info: 0,
        tag_type: TagType::Atomic,
        data_type: 0xC4,
        dimensions: 0,
        offset: 0,
    }]);

    let val = tags.iter().find(|t| t.full_name == "MyStruct.Val").expect("MyStruct.Val member tag present");
    assert_eq!(val.tag_type, TagType::Atomic);
    assert_eq!(val.data_type, 0xC4);
}
