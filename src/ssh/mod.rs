pub mod auth;
pub mod client;
pub mod handler;

pub use client::{SshTransport, SshTransportFactory, TransportSettings};
pub use handler::ClientHandler;
