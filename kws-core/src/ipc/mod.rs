//! Event types the controller publishes to hosts.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them verbatim (JSON lines, a UI event bus, a socket).

pub mod events;
