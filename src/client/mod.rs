//! Client side: framed connections and the routing key-value client

pub mod connection;
pub mod store;

pub use connection::{Connection, LinkState};
pub use store::KvClient;
