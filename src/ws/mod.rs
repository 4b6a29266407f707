//! Real-time delivery plane.
//!
//! One authenticated duplex socket per [`connection::ConnectionHandle`],
//! registered in the per-instance [`hub::Hub`]. The session handler in
//! [`session`] owns the upgrade endpoint and the inbound dispatch table.

pub mod connection;
pub mod hub;
pub mod session;

pub use connection::{ConnectionHandle, ConnectionId};
pub use hub::Hub;
