//! Exchange connectivity: WebSocket feed client, wire types, REST fallback.

pub mod client;
pub mod messages;
pub mod rest;
