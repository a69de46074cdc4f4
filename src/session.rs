//! Transport session (C3): encapsulation session registration, the
//! explicit-connection forward-open/forward-close handshake, request
//! framing, and reply classification.
//!
//! Grounded on `clx.py::Driver`'s `register_session`, `forward_open`,
//! `forward_close`, `_check_reply`, and `_get_sequence`, restructured per
//! `SPEC_FULL.md` §9: the reply parsers are pure functions over a byte
//! slice rather than methods that stash state on `self._reply`, and the
//! `Session` struct owns only connection state (handle, target_cid,
//! sequence counter, config) rather than scratch read buffers.

use log::{debug, info, trace, warn};

use crate::codec::{pack_u16, pack_u32, unpack_u32};
use crate::config::SessionConfig;
use crate::encap::{self, command};
use crate::error::{CipError, SessionError};
use crate::transport::{TcpTransport, Transport};

/// CIP service codes used by this client.
pub mod service_code {
    /// Get Attribute List.
    pub const GET_ATTRIBUTE_LIST: u8 = 0x03;
    /// Multiple Service Packet.
    pub const MULTIPLE_SERVICE_PACKET: u8 = 0x0A;
    /// Read Tag / Read Template.
    pub const READ_TAG: u8 = 0x4C;
    /// Write Tag.
    pub const WRITE_TAG: u8 = 0x4D;
    /// Forward Close.
    pub const FORWARD_CLOSE: u8 = 0x4E;
    /// Read Tag Fragmented.
    pub const READ_TAG_FRAGMENTED: u8 = 0x52;
    /// Write Tag Fragmented.
    pub const WRITE_TAG_FRAGMENTED: u8 = 0x53;
    /// Forward Open.
    pub const FORWARD_OPEN: u8 = 0x54;
    /// Get Instance Attribute List.
    pub const GET_INSTANCE_ATTRIBUTE_LIST: u8 = 0x55;
    /// The high bit a reply's service byte carries, distinguishing it
    /// from the request service code that was sent.
    pub const REPLY_BIT: u8 = 0x80;
}

/// CIP class codes used by this client.
pub mod class_code {
    /// Connection Manager.
    pub const CONNECTION_MANAGER: u8 = 0x06;
    /// Symbol Object.
    pub const SYMBOL_OBJECT: u8 = 0x6B;
    /// Template Object.
    pub const TEMPLATE_OBJECT: u8 = 0x6C;
}

/// Logical-segment prefixes used when building request paths to classes
/// and instances.
pub mod segment {
    /// 8-bit class segment.
    pub const CLASS_8: u8 = 0x20;
    /// 8-bit instance segment.
    pub const INSTANCE_8: u8 = 0x24;
    /// 16-bit instance segment, `0x25 0x00` prefix then a little-endian
    /// `u16`.
    pub const INSTANCE_16: u8 = 0x25;
}

/// CIP general status: success.
pub const GENERAL_STATUS_SUCCESS: u8 = 0x00;
/// "More data available"; the continuation signal for fragmented reads
/// and the tag-list/attribute-list enumeration loops.
pub const GENERAL_STATUS_MORE_DATA: u8 = 0x06;

/// A parsed CIP explicit-message reply: the service the peer answered,
/// its general status, any extended-status bytes, and the service-specific
/// reply data that follows.
#[derive(Debug, Clone)]
pub struct CipReply {
    /// Request service code being replied to (reply bit already masked
    /// off).
    pub service: u8,
    /// General status byte; `0x00` is success, `0x06` is "more data".
    pub status: u8,
    /// Extended-status words, raw.
    pub extended: Vec<u8>,
    /// Service-specific reply payload.
    pub data: Vec<u8>,
}

impl CipReply {
    /// Turn a non-success, non-more-data status into a `CipError`.
    /// Callers that handle `GENERAL_STATUS_MORE_DATA` themselves check
    /// `status` before calling this.
    pub fn into_result(self) -> Result<Self, CipError> {
        if self.status == GENERAL_STATUS_SUCCESS || self.status == GENERAL_STATUS_MORE_DATA {
            Ok(self)
        } else {
            Err(CipError::CipService {
                service: self.service,
                status: self.status,
                extended: if self.extended.is_empty() {
                    None
                } else {
                    Some(self.extended.clone())
                },
            })
        }
    }
}

/// Parse a CIP explicit-message reply header (`service | reserved |
/// status | ext_size | ext_words... | data...`) out of the data item
/// payload CPF handed back. Shared by unconnected (`send_rr_data`) and
/// connected (`send_unit_data`) replies; the caller has already stripped
/// the connected sequence-number prefix, if any.
pub(crate) fn parse_cip_reply(payload: &[u8]) -> Result<CipReply, CipError> {
    if payload.len() < 4 {
        return Err(CipError::Resolver(format!(
            "CIP reply truncated: {} bytes, need at least 4",
            payload.len()
        )));
    }
    let service = payload[0] & !service_code::REPLY_BIT;
    let status = payload[2];
    let ext_size_words = payload[3] as usize;
    let ext_bytes = ext_size_words * 2;
    let ext_start = 4;
    let ext_end = ext_start + ext_bytes;
    let extended = payload
        .get(ext_start..ext_end)
        .ok_or_else(|| CipError::Resolver("CIP reply extended-status truncated".into()))?
        .to_vec();
    let data = payload.get(ext_end..).unwrap_or(&[]).to_vec();
    Ok(CipReply {
        service,
        status,
        extended,
        data,
    })
}

/// Build the 4-byte `class/instance` request path addressed by an 8-bit
/// instance (used for the Connection Manager and Message Router).
pub fn class_instance_path(class: u8, instance: u8) -> Vec<u8> {
    vec![
        segment::CLASS_8,
        class,
        segment::INSTANCE_8,
        instance,
    ]
}

/// Build the 6-byte `class/instance` request path addressed by a 16-bit
/// instance (used for Symbol Object and Template Object lookups, whose
/// instance ids can exceed 255).
pub fn class_instance16_path(class: u8, instance: u16) -> Vec<u8> {
    let mut out = vec![segment::CLASS_8, class, segment::INSTANCE_16, 0x00];
    out.extend_from_slice(&pack_u16(instance));
    out
}

/// A connection to one controller. Single-owner: the sequence counter and
/// reply buffer are not safe for concurrent use.
#[derive(Debug)]
pub struct Session<T: Transport = TcpTransport> {
    transport: T,
    config: SessionConfig,
    pub(crate) handle: u32,
    pub(crate) target_cid: Option<[u8; 4]>,
    sequence: u16,
    context: [u8; 8],
}

impl Session<TcpTransport> {
    /// Connect over TCP and register an encapsulation session.
    ///
    /// Mirrors `clx.py::Driver.open`: connect, then immediately
    /// `register_session`; on failure the session is left unregistered
    /// (the `Session` is simply dropped, closing the socket).
    pub fn connect(host: &str, config: SessionConfig) -> Result<Self, CipError> {
        let timeout = std::time::Duration::from_secs(config.timeout_secs);
        let transport = TcpTransport::connect(host, config.port, timeout)
            .map_err(CipError::Transport)?;
        let mut session = Session::with_transport(transport, config);
        session.register_session()?;
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    /// Build a session over an already-connected transport. Exposed so
    /// tests can inject a `MockTransport`; production callers use
    /// `Session::connect`.
    pub fn with_transport(transport: T, config: SessionConfig) -> Self {
        let context = config.context;
        Session {
            transport,
            config,
            handle: 0,
            target_cid: None,
            sequence: 1,
            context,
        }
    }

    /// The session's registered handle, or 0 if not yet registered.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// `true` once `forward_open` has succeeded and not yet been closed.
    pub fn is_connected(&self) -> bool {
        self.target_cid.is_some()
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = if self.sequence < 65535 { self.sequence + 1 } else { 1 };
        self.sequence
    }

    fn send_and_receive(
        &mut self,
        command: u16,
        payload: &[u8],
    ) -> Result<(encap::EncapHeader, Vec<u8>), CipError> {
        let message = encap::build_message(command, self.handle, self.context, payload);
        self.transport.send(&message).map_err(CipError::Transport)?;

        let mut header_buf = [0u8; 24];
        self.transport
            .recv_exact(&mut header_buf)
            .map_err(CipError::Transport)?;
        let header = encap::EncapHeader::decode(&header_buf)?;
        if header.status != 0 {
            warn!("encapsulation command 0x{command:02x} failed: status 0x{:08x}", header.status);
            return Err(CipError::Encapsulation { status: header.status });
        }

        let mut body = vec![0u8; header.length as usize];
        self.transport.recv_exact(&mut body).map_err(CipError::Transport)?;
        trace!("recv command=0x{command:02x} body_len={}", body.len());
        Ok((header, body))
    }

    /// Register an encapsulation session. Idempotent: a no-op if already
    /// registered, matching `clx.py::register_session`'s early return.
    pub fn register_session(&mut self) -> Result<u32, CipError> {
        if self.handle != 0 {
            return Ok(self.handle);
        }
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&pack_u16(self.config.protocol_version));
        payload.extend_from_slice(&pack_u16(0));
        let (header, body) = self.send_and_receive(command::REGISTER_SESSION, &payload)?;
        if body.len() < 4 {
            return Err(CipError::Resolver(format!(
                "register_session reply truncated: {} bytes, need at least 4",
                body.len()
            )));
        }
        // The session handle is the encapsulation header's session field,
        // assigned by the peer; `clx.py::register_session` reads the same
        // value back out of its reply buffer at the equivalent offset.
        self.handle = header.session;
        info!("session registered: handle=0x{:08x}", self.handle);
        Ok(self.handle)
    }

    /// Unregister the session. No reply is expected.
    pub fn unregister_session(&mut self) -> Result<(), CipError> {
        if self.handle == 0 {
            return Err(CipError::Session(SessionError::NothingToClose));
        }
        let message = encap::build_message(command::UNREGISTER_SESSION, self.handle, self.context, &[]);
        self.transport.send(&message).map_err(CipError::Transport)?;
        debug!("session unregistered: handle=0x{:08x}", self.handle);
        self.handle = 0;
        Ok(())
    }

    /// Send an unconnected CIP request (`send_rr_data`) and return the
    /// parsed reply. Used for `forward_open`/`forward_close`.
    pub fn send_rr_data(&mut self, cip_payload: &[u8]) -> Result<CipReply, CipError> {
        if self.handle == 0 {
            return Err(CipError::Session(SessionError::NotRegistered("send_rr_data")));
        }
        let cpf = encap::build_unconnected_cpf(cip_payload);
        let (_header, body) = self.send_and_receive(command::SEND_RR_DATA, &cpf)?;
        let (_addr_type, _addr_data, _data_type, data) = encap::parse_cpf(&body)?;
        parse_cip_reply(&data)?.into_result()
    }

    /// Send a connected CIP request (`send_unit_data`), prefixed with the
    /// next sequence number, and return the parsed reply with the
    /// sequence prefix already stripped.
    pub fn send_unit_data(&mut self, cip_payload: &[u8]) -> Result<CipReply, CipError> {
        let target_cid = self
            .target_cid
            .ok_or(CipError::Session(SessionError::NotConnected("send_unit_data")))?;
        let seq = self.next_sequence();
        let mut framed = Vec::with_capacity(2 + cip_payload.len());
        framed.extend_from_slice(&pack_u16(seq));
        framed.extend_from_slice(cip_payload);
        let cpf = encap::build_connected_cpf(target_cid, &framed);
        let (_header, body) = self.send_and_receive(command::SEND_UNIT_DATA, &cpf)?;
        let (_addr_type, _addr_data, _data_type, data) = encap::parse_cpf(&body)?;
        if data.len() < 2 {
            return Err(CipError::Resolver("connected reply missing sequence prefix".into()));
        }
        parse_cip_reply(&data[2..])?.into_result()
    }

    /// Open an explicit (Class 3) connection to the controller's message
    /// router, over the backplane/slot path in `self.config`.
    ///
    /// Byte layout grounded on `clx.py::forward_open` / ODVA Volume 1
    /// §3-5.5.2: service, path-size, connection-manager path, priority
    /// and timeout ticks, originator CID/CSN/VID/VSN, timeout multiplier,
    /// O->T and T->O RPI (microseconds) and connection-parameter words,
    /// transport class, then the routing path to the target's message
    /// router over the backplane.
    pub fn forward_open(&mut self) -> Result<(), CipError> {
        if self.handle == 0 {
            return Err(CipError::Session(SessionError::NotRegistered("forward_open")));
        }
        let mut msg = Vec::new();
        msg.push(service_code::FORWARD_OPEN);
        msg.push(2); // request path size, words
        msg.extend_from_slice(&class_instance_path(class_code::CONNECTION_MANAGER, 0x01));
        msg.push(0x0A); // priority/time-tick
        msg.push(0x05); // timeout ticks
        msg.extend_from_slice(&pack_u32(0)); // O->T connection id, filled by target
        msg.extend_from_slice(&self.config.cid);
        msg.extend_from_slice(&self.config.csn);
        msg.extend_from_slice(&self.config.vid);
        msg.extend_from_slice(&self.config.vsn);
        msg.push(0x07); // connection timeout multiplier
        msg.extend_from_slice(&[0, 0, 0]); // reserved
        let rpi_us = self.config.rpi_ms.saturating_mul(1000);
        msg.extend_from_slice(&pack_u32(rpi_us)); // O->T RPI
        msg.extend_from_slice(&pack_u16(0x43F8)); // O->T connection parameters
        msg.extend_from_slice(&pack_u32(rpi_us)); // T->O RPI
        msg.extend_from_slice(&pack_u16(0x43F8)); // T->O connection parameters
        msg.push(0xA3); // transport class/trigger
        msg.push(0x01); // connection path size, words: backplane segment
        msg.push(self.config.backplane);
        msg.push(self.config.cpu_slot);
        msg.extend_from_slice(&class_instance_path(0x02, 0x01)); // Message Router, instance 1

        let reply = self.send_rr_data(&msg)?;
        if reply.data.len() < 4 {
            return Err(CipError::Resolver("forward_open reply missing target CID".into()));
        }
        let mut target_cid = [0u8; 4];
        target_cid.copy_from_slice(&reply.data[0..4]);
        self.target_cid = Some(target_cid);
        info!("forward_open succeeded: target_cid={:08x}", unpack_u32(&target_cid));
        Ok(())
    }

    /// Close the explicit connection opened by `forward_open`.
    ///
    /// Byte layout grounded on `clx.py::forward_close`: service,
    /// path-size, connection-manager path, priority/timeout ticks, CSN,
    /// VID, VSN, then the same backplane/slot routing path used to open
    /// it.
    pub fn forward_close(&mut self) -> Result<(), CipError> {
        if self.target_cid.is_none() {
            return Err(CipError::Session(SessionError::NothingToClose));
        }
        let mut msg = Vec::new();
        msg.push(service_code::FORWARD_CLOSE);
        msg.push(2);
        msg.extend_from_slice(&class_instance_path(class_code::CONNECTION_MANAGER, 0x01));
        msg.push(0x0A);
        msg.push(0x05);
        msg.extend_from_slice(&self.config.csn);
        msg.extend_from_slice(&self.config.vid);
        msg.extend_from_slice(&self.config.vsn);
        msg.push(0x01); // connection path size, words
        msg.push(0x00); // reserved
        msg.push(self.config.backplane);
        msg.push(self.config.cpu_slot);
        msg.extend_from_slice(&class_instance_path(0x02, 0x01));

        self.send_rr_data(&msg)?;
        self.target_cid = None;
        debug!("forward_close succeeded");
        Ok(())
    }

    /// Close the connection and the session, mirroring
    /// `clx.py::Driver.close`: forward_close first if connected, then
    /// unregister if registered. Errors in either step are reported but
    /// don't prevent the other from being attempted.
    pub fn close(&mut self) -> Result<(), CipError> {
        let mut first_err = None;
        if self.is_connected() {
            if let Err(e) = self.forward_close() {
                warn!("forward_close failed during close(): {e}");
                first_err = Some(e);
            }
        }
        if self.handle != 0 {
            if let Err(e) = self.unregister_session() {
                warn!("unregister_session failed during close(): {e}");
                first_err = first_err.or(Some(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
