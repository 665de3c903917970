//! sightline-server: WebSocket front end for the Sightline detector
//!
//! `acceptor` binds the listener, `websocket` bridges each upgraded socket
//! to a `session`, and `worker_pool` bounds the blocking decode/inference
//! jobs sessions submit.

pub mod acceptor;
pub mod config_loader;
pub mod session;
pub mod websocket;
pub mod worker_pool;
