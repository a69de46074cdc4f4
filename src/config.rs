//! Session configuration.
//!
//! The reference implementation keeps these as entries in a plain dict
//! (`clx.py::Driver.attribs`); here they're a typed builder struct with
//! the same field set and defaults.

/// Tunable parameters for a `Session`. `Default` matches the reference
/// implementation's defaults, including the literal originator
/// CID/CSN/VID/VSN bytes, so a default-built client produces the same
/// wire bytes when the caller doesn't override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// TCP port. Default 0xAF12 (44818).
    pub port: u16,
    /// Socket read timeout, in seconds. Default 10.
    pub timeout_secs: u64,
    /// Encapsulation protocol version. Default 1.
    pub protocol_version: u16,
    /// Backplane number in the CPU path. Default 1.
    pub backplane: u8,
    /// CPU slot number in the CPU path. Default 0.
    pub cpu_slot: u8,
    /// Requested packet interval, in milliseconds. Default 5000.
    pub rpi_ms: u32,
    /// 8-byte sender context echoed by the peer.
    pub context: [u8; 8],
    /// Originator connection id used in forward-open.
    pub cid: [u8; 4],
    /// Originator connection serial number used in forward-open.
    pub csn: [u8; 2],
    /// Originator vendor id used in forward-open.
    pub vid: [u8; 2],
    /// Originator vendor serial number used in forward-open.
    pub vsn: [u8; 4],
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            port: 0xAF12,
            timeout_secs: 10,
            protocol_version: 1,
            backplane: 1,
            cpu_slot: 0,
            rpi_ms: 5000,
            context: *b"_enip_cl",
            cid: [0x27, 0x04, 0x19, 0x71],
            csn: [0x27, 0x04],
            vid: [0x09, 0x10],
            vsn: [0x09, 0x10, 0x19, 0x71],
        }
    }
}

impl SessionConfig {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the TCP port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the socket read timeout.
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Override the backplane/slot CPU path.
    pub fn with_cpu_path(mut self, backplane: u8, cpu_slot: u8) -> Self {
        self.backplane = backplane;
        self.cpu_slot = cpu_slot;
        self
    }

    /// Override the requested packet interval, in milliseconds.
    pub fn with_rpi_ms(mut self, rpi_ms: u32) -> Self {
        self.rpi_ms = rpi_ms;
        self
    }

    /// Override the 8-byte sender context.
    pub fn with_context(mut self, context: [u8; 8]) -> Self {
        self.context = context;
        self
    }

    /// Override the originator connection id used in forward-open.
    pub fn with_cid(mut self, cid: [u8; 4]) -> Self {
        self.cid = cid;
        self
    }

    /// Override the originator connection serial number used in
    /// forward-open.
    pub fn with_csn(mut self, csn: [u8; 2]) -> Self {
        self.csn = csn;
        self
    }

    /// Override the originator vendor id used in forward-open.
    pub fn with_vid(mut self, vid: [u8; 2]) -> Self {
        self.vid = vid;
        self
    }

    /// Override the originator vendor serial number used in
    /// forward-open.
    pub fn with_vsn(mut self, vsn: [u8; 4]) -> Self {
        self.vsn = vsn;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 0xAF12);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.rpi_ms, 5000);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = SessionConfig::new()
            .with_port(1234)
            .with_cpu_path(2, 3)
            .with_rpi_ms(1000);
        assert_eq!(config.port, 1234);
        assert_eq!(config.backplane, 2);
        assert_eq!(config.cpu_slot, 3);
        assert_eq!(config.rpi_ms, 1000);
    }

    #[test]
    fn identity_field_overrides_apply() {
        let config = SessionConfig::new()
            .with_cid([1, 2, 3, 4])
            .with_csn([5, 6])
            .with_vid([7, 8])
            .with_vsn([9, 10, 11, 12]);
        assert_eq!(config.cid, [1, 2, 3, 4]);
        assert_eq!(config.csn, [5, 6]);
        assert_eq!(config.vid, [7, 8]);
        assert_eq!(config.vsn, [9, 10, 11, 12]);
    }
}
