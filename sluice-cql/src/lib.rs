//! Defines CQL protocol-level types used by the `sluice` driver.
//!
//! Covers the frame header and its extensions, the protocol versions the driver speaks
//! (including the DSE versions that carry continuous paging), and the requests and
//! responses exchanged during connection setup and query execution.
//!
//! Responses can also be serialized and requests deserialized. The driver never needs
//! that, but a test server built on the same code does.

pub mod frame;

pub use crate::frame::protocol_version::ProtocolVersion;
pub use crate::frame::types::{Consistency, SerialConsistency};
