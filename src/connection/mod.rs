//! Physical connections and the requests they carry.

pub mod slot;
pub mod tcp;

pub use slot::{Request, ResultSlot, SlotReceiver};
pub use tcp::{ClosingConnection, Connection, ConnectionState};
