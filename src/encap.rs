//! EtherNet/IP encapsulation framing: the 24-byte header and the common
//! packet format (CPF) used to wrap `send_rr_data`/`send_unit_data`
//! payloads.
//!
//! Byte layout is grounded on `eip.py::EipBase.__build_header` and
//! `clx.py::Driver.build_header`/`build_common_packet_format`.

use crate::codec::{pack_u16, pack_u32, unpack_u16, unpack_u32};
use crate::error::CipError;

/// Encapsulation command codes.
pub mod command {
    /// No-op; used only to check the TCP connection is alive.
    pub const NOP: u16 = 0x00;
    /// Locate and identify the target, UDP-discovery style.
    pub const LIST_IDENTITY: u16 = 0x63;
    /// Register an encapsulation session.
    pub const REGISTER_SESSION: u16 = 0x65;
    /// Unregister an encapsulation session.
    pub const UNREGISTER_SESSION: u16 = 0x66;
    /// Transfer an encapsulated unconnected request/reply (rr) message.
    pub const SEND_RR_DATA: u16 = 0x6F;
    /// Transfer an encapsulated connected message.
    pub const SEND_UNIT_DATA: u16 = 0x70;
}

/// CPF address type codes.
pub mod address_type {
    /// Unconnected messaging, zero-length address data.
    pub const UCMM: u16 = 0x0000;
    /// Connection-based messaging; address data is the 4-byte target CID.
    pub const CONNECTION_BASED: u16 = 0x00A1;
}

/// CPF data item type codes.
pub mod data_type {
    /// Unconnected message data.
    pub const UNCONNECTED: u16 = 0x00B2;
    /// Connected message data.
    pub const CONNECTED: u16 = 0x00B1;
}

const HEADER_LEN: usize = 24;

/// The 24-byte EtherNet/IP encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    /// One of the `command` constants.
    pub command: u16,
    /// Length of the data following this header.
    pub length: u16,
    /// Session handle, 0 before registration.
    pub session: u32,
    /// Status: 0 on success.
    pub status: u32,
    /// Sender context, echoed verbatim by the peer.
    pub context: [u8; 8],
    /// Protocol options, always 0 in this client.
    pub options: u32,
}

impl EncapHeader {
    /// Serialize the header to its 24-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&pack_u16(self.command));
        out[2..4].copy_from_slice(&pack_u16(self.length));
        out[4..8].copy_from_slice(&pack_u32(self.session));
        out[8..12].copy_from_slice(&pack_u32(self.status));
        out[12..20].copy_from_slice(&self.context);
        out[20..24].copy_from_slice(&pack_u32(self.options));
        out
    }

    /// Parse a 24-byte header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, CipError> {
        if data.len() < HEADER_LEN {
            return Err(CipError::Resolver(format!(
                "encapsulation header truncated: got {} bytes, need {HEADER_LEN}",
                data.len()
            )));
        }
        let mut context = [0u8; 8];
        context.copy_from_slice(&data[12..20]);
        Ok(EncapHeader {
            command: unpack_u16(&data[0..2]),
            length: unpack_u16(&data[2..4]),
            session: unpack_u32(&data[4..8]),
            status: unpack_u32(&data[8..12]),
            context,
            options: unpack_u32(&data[20..24]),
        })
    }
}

/// Build a full encapsulation message: header followed by `payload`.
pub fn build_message(command: u16, session: u32, context: [u8; 8], payload: &[u8]) -> Vec<u8> {
    let header = EncapHeader {
        command,
        length: payload.len() as u16,
        session,
        status: 0,
        context,
        options: 0,
    };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Wrap a CIP message in the common packet format (CPF), with an address
/// item (UCMM or connection-based) and a data item (unconnected or
/// connected).
///
/// Layout:
/// `interface u32=0 | timeout u16 | item_count u16=2 |`
/// `address_type u16 | address_len u16 | address_data... |`
/// `data_type u16 | data_len u16 | payload...`
pub fn build_cpf(address_type: u16, address_data: &[u8], data_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + address_data.len() + payload.len());
    out.extend_from_slice(&pack_u32(0)); // interface handle
    out.extend_from_slice(&pack_u16(0)); // timeout
    out.extend_from_slice(&pack_u16(2)); // item count
    out.extend_from_slice(&pack_u16(address_type));
    out.extend_from_slice(&pack_u16(address_data.len() as u16));
    out.extend_from_slice(address_data);
    out.extend_from_slice(&pack_u16(data_type));
    out.extend_from_slice(&pack_u16(payload.len() as u16));
    out.extend_from_slice(payload);
    out
}

/// Build the CPF payload for an unconnected (UCMM) message, as used by
/// `forward_open`/`forward_close`.
pub fn build_unconnected_cpf(payload: &[u8]) -> Vec<u8> {
    build_cpf(address_type::UCMM, &[], data_type::UNCONNECTED, payload)
}

/// Build the CPF payload for a connected message addressed to
/// `target_cid`, as used by `read_tag`/`write_tag`/the resolver services.
pub fn build_connected_cpf(target_cid: [u8; 4], payload: &[u8]) -> Vec<u8> {
    build_cpf(
        address_type::CONNECTION_BASED,
        &target_cid,
        data_type::CONNECTED,
        payload,
    )
}

/// Parse a two-item CPF buffer back into `(address_type, address_data,
/// data_type, payload)`. Used by the session layer to pull the reply
/// payload out from under its address item.
pub fn parse_cpf(data: &[u8]) -> Result<(u16, Vec<u8>, u16, Vec<u8>), CipError> {
    let fail = |msg: &str| CipError::Resolver(format!("CPF parse error: {msg}"));
    if data.len() < 8 {
        return Err(fail("truncated CPF header"));
    }
    let item_count = unpack_u16(&data[6..8]);
    if item_count != 2 {
        return Err(fail(&format!("expected 2 CPF items, got {item_count}")));
    }
    let mut pos = 8;
    let address_type = unpack_u16(data.get(pos..pos + 2).ok_or_else(|| fail("truncated address item"))?);
    pos += 2;
    let address_len = unpack_u16(data.get(pos..pos + 2).ok_or_else(|| fail("truncated address len"))?) as usize;
    pos += 2;
    let address_data = data
        .get(pos..pos + address_len)
        .ok_or_else(|| fail("truncated address data"))?
        .to_vec();
    pos += address_len;
    let data_type = unpack_u16(data.get(pos..pos + 2).ok_or_else(|| fail("truncated data item"))?);
    pos += 2;
    let data_len = unpack_u16(data.get(pos..pos + 2).ok_or_else(|| fail("truncated data len"))?) as usize;
    pos += 2;
    let payload = data
        .get(pos..pos + data_len)
        .ok_or_else(|| fail("truncated data payload"))?
        .to_vec();
    Ok((address_type, address_data, data_type, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EncapHeader {
            command: command::REGISTER_SESSION,
            length: 4,
            session: 0x1122_3344,
            status: 0,
            context: *b"_enip_cl",
            options: 0,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = EncapHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn cpf_unconnected_layout() {
        let cpf = build_unconnected_cpf(&[0xAA, 0xBB]);
        // interface(4) + timeout(2) + count(2) + addr_type(2) + addr_len(2)=0
        // + data_type(2) + data_len(2) + payload(2) = 18
        assert_eq!(cpf.len(), 18);
        assert_eq!(&cpf[8..10], &pack_u16(address_type::UCMM));
        assert_eq!(&cpf[10..12], &pack_u16(0)); // zero-length address
        assert_eq!(&cpf[12..14], &pack_u16(data_type::UNCONNECTED));
        assert_eq!(&cpf[16..18], &[0xAA, 0xBB]);
    }

    #[test]
    fn cpf_connected_layout_carries_target_cid() {
        let cid = [0xaa, 0xbb, 0xcc, 0xdd];
        let cpf = build_connected_cpf(cid, &[1, 2, 3]);
        assert_eq!(&cpf[8..10], &pack_u16(address_type::CONNECTION_BASED));
        assert_eq!(&cpf[10..12], &pack_u16(4));
        assert_eq!(&cpf[12..16], &cid);
        assert_eq!(&cpf[16..18], &pack_u16(data_type::CONNECTED));
        assert_eq!(&cpf[20..23], &[1, 2, 3]);
    }

    #[test]
    fn parse_cpf_round_trips_unconnected() {
        let cpf = build_unconnected_cpf(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let (addr_type, addr_data, data_type, payload) = parse_cpf(&cpf).unwrap();
        assert_eq!(addr_type, address_type::UCMM);
        assert!(addr_data.is_empty());
        assert_eq!(data_type, data_type::UNCONNECTED);
        assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn parse_cpf_round_trips_connected() {
        let cid = [1, 2, 3, 4];
        let cpf = build_connected_cpf(cid, &[9, 9]);
        let (addr_type, addr_data, data_type, payload) = parse_cpf(&cpf).unwrap();
        assert_eq!(addr_type, address_type::CONNECTION_BASED);
        assert_eq!(addr_data, cid);
        assert_eq!(data_type, data_type::CONNECTED);
        assert_eq!(payload, vec![9, 9]);
    }
}
