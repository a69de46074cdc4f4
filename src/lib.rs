#![warn(missing_docs)]
/*! This crate provides a client for EtherNet/IP + CIP (Common Industrial
Protocol), the protocol used by Rockwell Logix-family PLCs (ControlLogix,
CompactLogix) to expose their symbol table of named tags over Ethernet.

It speaks two nested protocols over a single TCP connection to port
0xAF12 (44818): the EtherNet/IP encapsulation layer (session registration,
framing), and within it, CIP (explicit messaging: forward-open a
connection, then read/write tags by symbolic name).

# Architecture overview

```text
[ resolver ]  get_tag_list / get_tag_struct / read_template, tree build
      |
[ service ]   read_tag / read_array / write_tag / write_array, IOI paths
      |
[ session ]   register_session, forward_open/close, sequence counter
      |
[ encap ]     24-byte header + common packet format framing
      |
[ transport ] TCP connect, blocking send/recv
```

A session is single-owner: one logical caller drives one TCP connection
at a time, because the sequence counter and reply buffer are not safe for
concurrent use. Multiple sessions, each to the same or different
controllers, are independent and may run on separate threads.

# Examples

```no_run
use enip_client::{service, Session, SessionConfig};

let mut session = Session::connect("192.168.1.10", SessionConfig::default())?;
let value = service::read_tag(&mut session, "Counts")?;
println!("Counts = {value:?}");
# Ok::<(), enip_client::CipError>(())
```

## Links

* Reference implementation this crate's wire behavior was grounded on:
  `pycomm`'s `ab_comm.clx` driver and ODVA's CIP specification volumes 1
  and 2 (for the protocol itself; extended-status text is not decoded
  here, see `CipError::CipService`).
 */

pub mod codec;
pub mod config;
pub mod encap;
pub mod error;
pub mod model;
pub mod path;
pub mod resolver;
pub mod service;
pub mod session;
pub mod transport;

pub use config::SessionConfig;
pub use error::CipError;
pub use model::{SymbolType, Tag, TagType, TagValue, Template, TemplateMember};
pub use session::Session;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, CipError>;
