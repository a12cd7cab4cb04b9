//! Client side of the status pipeline: fetch, push connection and reconciliation.

pub mod connection;
pub mod http;
pub mod reconcile;

pub use connection::StatusConnection;
pub use http::SensorApiClient;
pub use reconcile::{ClientState, ClientStore, SensorRow};
