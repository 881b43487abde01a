//! Control plane: one JSON request per connection over a local Unix
//! socket, one JSON response back, then close.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use protocol::{
    GroupStatus, NetworkStatusInfo, Request, RequestData, Response, StatusResponse, TunnelStatusInfo,
};
pub use server::{ControlServer, RequestHandler};
