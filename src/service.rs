//! Tag service layer (C4): `read_tag`/`read_array`/`write_tag`/
//! `write_array` and multiple-service-packet batching, on top of
//! `Session`'s connected messaging.
//!
//! Byte-for-byte grounded on `clx.py::read_tag`/`read_array`/`write_tag`/
//! `write_array`, with two corrections noted in `SPEC_FULL.md` §9: a
//! fresh `byte_offset`/`last_position` per `read_array` call (the source
//! never resets them on re-entry), and a two-pass remove in
//! `write_tag_multi` (collect failing indices first, skip them when
//! building the request, rather than mutating the caller's list while
//! iterating it).

use log::{trace, warn};

use crate::codec::{self, AtomicType, AtomicValue};
use crate::error::{CipError, SessionError};
use crate::path;
use crate::session::{service_code, CipReply, Session, GENERAL_STATUS_MORE_DATA, GENERAL_STATUS_SUCCESS};
use crate::transport::Transport;

/// Open the connection lazily if it isn't already, mirroring
/// `clx.py`'s `if not self._target_is_connected: self.forward_open()`
/// guard at the top of every tag operation.
pub(crate) fn ensure_connected<T: Transport>(session: &mut Session<T>, op: &'static str) -> Result<(), CipError> {
    if session.is_connected() {
        return Ok(());
    }
    session.forward_open().map_err(|e| {
        warn!("lazy forward_open failed before {op}: {e}");
        CipError::Session(SessionError::NotConnected(op))
    })
}

fn decode_tagged_value(data: &[u8]) -> Result<AtomicValue, CipError> {
    if data.len() < 2 {
        return Err(CipError::Resolver("tag reply missing data-type prefix".into()));
    }
    let type_code = codec::unpack_u16(&data[0..2]);
    let ty = AtomicType::from_code(type_code).ok_or(crate::error::CodecError::UnknownDataType(type_code))?;
    Ok(codec::unpack(ty, &data[2..2 + ty.size()])?)
}

/// Read one scalar tag by name.
pub fn read_tag<T: Transport>(session: &mut Session<T>, name: &str) -> Result<AtomicValue, CipError> {
    ensure_connected(session, "read_tag")?;
    let rp = path::build_request_path(name)?;
    let mut msg = Vec::with_capacity(4 + rp.len());
    msg.push(service_code::READ_TAG);
    msg.push((rp.len() / 2) as u8);
    msg.extend_from_slice(&rp);
    msg.extend_from_slice(&codec::pack_u16(1));
    let reply = session.send_unit_data(&msg)?;
    decode_tagged_value(&reply.data)
}

/// One sub-reply from a batched read, paired with the tag name it
/// answers.
#[derive(Debug)]
pub struct TagReadResult {
    /// The tag name as given to `read_tag_multi`.
    pub tag_name: String,
    /// The decoded value, or the per-item error the peer reported.
    pub result: Result<AtomicValue, CipError>,
}

/// One sub-reply from a batched write.
#[derive(Debug)]
pub struct TagWriteResult {
    /// The tag name as given to `write_tag_multi`.
    pub tag_name: String,
    /// `Ok(())` on success, or the per-item error the peer reported.
    pub result: Result<(), CipError>,
}

/// Build a Multiple Service Packet request wrapping each of `items` (a
/// fully-formed CIP sub-request body per item) addressed to the Message
/// Router (class 0x02, instance 1).
fn build_multiple_service(items: &[Vec<u8>]) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.push(service_code::MULTIPLE_SERVICE_PACKET);
    msg.push(2);
    msg.extend_from_slice(&crate::session::class_instance_path(0x02, 0x01));
    msg.extend_from_slice(&codec::pack_u16(items.len() as u16));
    let table_start = 2usize; // offsets are measured from the count field
    let mut offset = table_start + items.len() * 2;
    for item in items {
        msg.extend_from_slice(&codec::pack_u16(offset as u16));
        offset += item.len();
    }
    for item in items {
        msg.extend_from_slice(item);
    }
    msg
}

/// Parse a Multiple Service Packet reply body (the count, offset table,
/// and sub-replies that follow the outer CIP reply header) into one
/// `CipReply` per sub-request, in request order.
fn parse_multiple_service_reply(data: &[u8]) -> Result<Vec<CipReply>, CipError> {
    if data.len() < 2 {
        return Err(CipError::Resolver("multiple service reply missing count".into()));
    }
    let count = codec::unpack_u16(&data[0..2]) as usize;
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let start = 2 + i * 2;
        let raw = data
            .get(start..start + 2)
            .ok_or_else(|| CipError::Resolver("multiple service reply offset table truncated".into()))?;
        offsets.push(codec::unpack_u16(raw) as usize);
    }
    let mut replies = Vec::with_capacity(count);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        let sub = data
            .get(start..end)
            .ok_or_else(|| CipError::Resolver(format!("multiple service sub-reply {i} out of bounds")))?;
        replies.push(crate::session::parse_cip_reply(sub)?);
    }
    Ok(replies)
}

/// Read many tags in one Multiple Service Packet request.
/// The outer call only fails on a transport/framing error; a per-item
/// CIP failure is reported in that item's `result` without failing the
/// batch.
pub fn read_tag_multi<T: Transport>(
    session: &mut Session<T>,
    names: &[&str],
) -> Result<Vec<TagReadResult>, CipError> {
    ensure_connected(session, "read_tag_multi")?;
    let mut items = Vec::with_capacity(names.len());
    for name in names {
        let rp = path::build_request_path(name)?;
        let mut item = Vec::with_capacity(4 + rp.len());
        item.push(service_code::READ_TAG);
        item.push((rp.len() / 2) as u8);
        item.extend_from_slice(&rp);
        item.extend_from_slice(&codec::pack_u16(1));
        items.push(item);
    }
    let msg = build_multiple_service(&items);
    let reply = session.send_unit_data(&msg)?;
    let sub_replies = parse_multiple_service_reply(&reply.data)?;
    Ok(names
        .iter()
        .zip(sub_replies)
        .map(|(name, sub)| TagReadResult {
            tag_name: name.to_string(),
            result: classify_sub_reply(sub).and_then(|r| decode_tagged_value(&r.data)),
        })
        .collect())
}

fn classify_sub_reply(reply: CipReply) -> Result<CipReply, CipError> {
    if reply.status == GENERAL_STATUS_SUCCESS {
        Ok(reply)
    } else {
        Err(CipError::CipService {
            service: reply.service,
            status: reply.status,
            extended: if reply.extended.is_empty() { None } else { Some(reply.extended) },
        })
    }
}

/// Write many `(tag_name, value)` pairs in one Multiple Service Packet
/// request. Items whose request path fails to build are skipped from
/// the batch sent on the wire and reported as failed in a second pass,
/// rather than mutating the input while building the batch.
pub fn write_tag_multi<T: Transport>(
    session: &mut Session<T>,
    tags: &[(&str, AtomicValue)],
) -> Result<Vec<TagWriteResult>, CipError> {
    ensure_connected(session, "write_tag_multi")?;
    let mut items = Vec::new();
    let mut failed_indices = Vec::new();
    for (i, (name, _value)) in tags.iter().enumerate() {
        match path::build_request_path(name) {
            Ok(rp) => items.push((i, rp)),
            Err(e) => {
                warn!("tag {name} removed from write batch: {e}");
                failed_indices.push(i);
            }
        }
    }
    let mut encoded = Vec::with_capacity(items.len());
    for (i, rp) in &items {
        let value = &tags[*i].1;
        let mut item = Vec::new();
        item.push(service_code::WRITE_TAG);
        item.push((rp.len() / 2) as u8);
        item.extend_from_slice(rp);
        item.extend_from_slice(&codec::pack_u16(value.atomic_type().code() as u16));
        item.extend_from_slice(&codec::pack_u16(1));
        item.extend_from_slice(&value.pack());
        encoded.push(item);
    }
    let msg = build_multiple_service(&encoded);
    let reply = session.send_unit_data(&msg)?;
    let sub_replies = parse_multiple_service_reply(&reply.data)?;

    let mut results: Vec<Option<TagWriteResult>> = (0..tags.len()).map(|_| None).collect();
    for failed_idx in failed_indices {
        results[failed_idx] = Some(TagWriteResult {
            tag_name: tags[failed_idx].0.to_string(),
            result: Err(CipError::Resolver("request path build failed".into())),
        });
    }
    for ((i, _), sub) in items.iter().zip(sub_replies) {
        results[*i] = Some(TagWriteResult {
            tag_name: tags[*i].0.to_string(),
            result: classify_sub_reply(sub).map(|_| ()),
        });
    }
    Ok(results.into_iter().map(|r| r.expect("every index filled")).collect())
}

/// Write one scalar tag.
pub fn write_tag<T: Transport>(session: &mut Session<T>, name: &str, value: AtomicValue) -> Result<(), CipError> {
    ensure_connected(session, "write_tag")?;
    let rp = path::build_request_path(name)?;
    let mut msg = Vec::new();
    msg.push(service_code::WRITE_TAG);
    msg.push((rp.len() / 2) as u8);
    msg.extend_from_slice(&rp);
    msg.extend_from_slice(&codec::pack_u16(value.atomic_type().code() as u16));
    msg.extend_from_slice(&codec::pack_u16(1));
    msg.extend_from_slice(&value.pack());
    session.send_unit_data(&msg)?;
    Ok(())
}

/// Read `count` elements of an array tag, reassembling across
/// `Read Tag Fragmented` continuations.
///
/// `byte_offset`/accumulated position are local to this call, fixing the
/// reference implementation's bug of never resetting them on re-entry.
pub fn read_array<T: Transport>(
    session: &mut Session<T>,
    name: &str,
    count: u16,
) -> Result<Vec<AtomicValue>, CipError> {
    ensure_connected(session, "read_array")?;
    let rp = path::build_request_path(name)?;
    let mut byte_offset: u32 = 0;
    let mut values = Vec::new();
    loop {
        let mut msg = Vec::new();
        msg.push(service_code::READ_TAG_FRAGMENTED);
        msg.push((rp.len() / 2) as u8);
        msg.extend_from_slice(&rp);
        msg.extend_from_slice(&codec::pack_u16(count));
        msg.extend_from_slice(&codec::pack_u32(byte_offset));
        let reply = session.send_unit_data(&msg)?;

        if reply.data.len() < 2 {
            return Err(CipError::Resolver("read_array fragment missing data-type prefix".into()));
        }
        let type_code = codec::unpack_u16(&reply.data[0..2]);
        let ty = AtomicType::from_code(type_code).ok_or(crate::error::CodecError::UnknownDataType(type_code))?;
        let fragment = &reply.data[2..];
        let mut idx = 0;
        while idx + ty.size() <= fragment.len() {
            values.push(codec::unpack(ty, &fragment[idx..idx + ty.size()])?);
            idx += ty.size();
        }
        trace!("read_array {name}: {} elements so far", values.len());

        match reply.status {
            GENERAL_STATUS_SUCCESS => break,
            GENERAL_STATUS_MORE_DATA => byte_offset += fragment.len() as u32,
            other => {
                return Err(CipError::CipService {
                    service: reply.service,
                    status: other,
                    extended: None,
                })
            }
        }
    }
    Ok(values)
}

/// Write an array tag, splitting `values` into ≤450-element-byte
/// fragments. The element count sent in every
/// fragment's request is the total, not the fragment size.
pub fn write_array<T: Transport>(
    session: &mut Session<T>,
    name: &str,
    ty: AtomicType,
    values: &[AtomicValue],
) -> Result<(), CipError> {
    ensure_connected(session, "write_array")?;
    let rp = path::build_request_path(name)?;
    let mut byte_offset: u32 = 0;
    let mut chunk = Vec::new();
    let mut chunk_bytes = 0usize;

    for (i, value) in values.iter().enumerate() {
        chunk.extend_from_slice(&value.pack());
        chunk_bytes += ty.size();
        let is_last = i == values.len() - 1;
        if chunk_bytes >= 450 || is_last {
            let mut msg = Vec::new();
            msg.push(service_code::WRITE_TAG_FRAGMENTED);
            msg.push((rp.len() / 2) as u8);
            msg.extend_from_slice(&rp);
            msg.extend_from_slice(&codec::pack_u16(ty.code() as u16));
            msg.extend_from_slice(&codec::pack_u16(values.len() as u16));
            msg.extend_from_slice(&codec::pack_u32(byte_offset));
            msg.extend_from_slice(&chunk);
            session.send_unit_data(&msg)?;
            byte_offset += chunk_bytes as u32;
            chunk.clear();
            chunk_bytes = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::encap::{self, command};
    use crate::transport::MockTransport;

    fn connected_session(replies: Vec<Vec<u8>>) -> Session<MockTransport> {
        let transport = MockTransport::new(replies);
        let mut session = Session::with_transport(transport, SessionConfig::default());
        session.handle = 1;
        session.target_cid = Some([1, 2, 3, 4]);
        session
    }

    fn unit_data_reply(session_handle: u32, seq: u16, cip_reply: &[u8]) -> Vec<u8> {
        let mut connected_payload = codec::pack_u16(seq).to_vec();
        connected_payload.extend_from_slice(cip_reply);
        let cpf = encap::build_connected_cpf([1, 2, 3, 4], &connected_payload);
        encap::build_message(command::SEND_UNIT_DATA, session_handle, *b"_enip_cl", &cpf)
    }

    fn cip_reply_bytes(service: u8, status: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![service | 0x80, 0x00, status, 0x00];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn read_tag_decodes_atomic_value() {
        let mut data = codec::pack_u16(AtomicType::Dint.code() as u16).to_vec();
        data.extend_from_slice(&42i32.to_le_bytes());
        let cip_reply = cip_reply_bytes(service_code::READ_TAG, 0x00, &data);
        let reply = unit_data_reply(1, 2, &cip_reply);
        let mut session = connected_session(vec![reply]);

        let value = read_tag(&mut session, "Counts").unwrap();
        assert_eq!(value, AtomicValue::Dint(42));
    }

    #[test]
    fn write_tag_succeeds_on_zero_status() {
        let cip_reply = cip_reply_bytes(service_code::WRITE_TAG, 0x00, &[]);
        let reply = unit_data_reply(1, 2, &cip_reply);
        let mut session = connected_session(vec![reply]);
        write_tag(&mut session, "Counts", AtomicValue::Dint(7)).unwrap();
    }

    #[test]
    fn read_array_reassembles_two_fragments() {
        // 300 INT elements, split across two fragments.
        let values: Vec<i16> = (0..300).collect();
        let mut frag1 = codec::pack_u16(AtomicType::Int.code() as u16).to_vec();
        for v in &values[0..150] {
            frag1.extend_from_slice(&v.to_le_bytes());
        }
        let mut frag2 = codec::pack_u16(AtomicType::Int.code() as u16).to_vec();
        for v in &values[150..300] {
            frag2.extend_from_slice(&v.to_le_bytes());
        }
        let reply1 = unit_data_reply(1, 2, &cip_reply_bytes(service_code::READ_TAG_FRAGMENTED, GENERAL_STATUS_MORE_DATA, &frag1));
        let reply2 = unit_data_reply(1, 3, &cip_reply_bytes(service_code::READ_TAG_FRAGMENTED, GENERAL_STATUS_SUCCESS, &frag2));
        let mut session = connected_session(vec![reply1, reply2]);

        let decoded = read_array(&mut session, "Arr", 300).unwrap();
        assert_eq!(decoded.len(), 300);
        assert_eq!(decoded[0], AtomicValue::Int(0));
        assert_eq!(decoded[299], AtomicValue::Int(299));
    }

    #[test]
    fn multiple_service_packet_round_trips_offsets() {
        let item_a = vec![0xAA, 0xBB];
        let item_b = vec![0xCC, 0xDD, 0xEE];
        let msg = build_multiple_service(&[item_a.clone(), item_b.clone()]);
        // service(1) + path_size(1) + path(4) = 6 bytes before the count field.
        assert_eq!(codec::unpack_u16(&msg[6..8]), 2);
        let reply_body = {
            let mut out = codec::pack_u16(2).to_vec();
            let table_start = 2;
            let r0 = cip_reply_bytes(0x4C, 0x00, &[1]);
            let r1 = cip_reply_bytes(0x4D, 0x00, &[2]);
            out.extend_from_slice(&codec::pack_u16((table_start + 4) as u16));
            out.extend_from_slice(&codec::pack_u16((table_start + 4 + r0.len()) as u16));
            out.extend_from_slice(&r0);
            out.extend_from_slice(&r1);
            out
        };
        let parsed = parse_multiple_service_reply(&reply_body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].service, 0x4C);
        assert_eq!(parsed[1].service, 0x4D);
    }
}
