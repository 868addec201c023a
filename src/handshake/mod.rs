//! The HTTP/1.1 upgrade dance on both sides of a connection: [`server`]
//! validates and answers an incoming upgrade request, [`client`] dials out
//! and validates the response.

pub mod client;
pub mod server;
