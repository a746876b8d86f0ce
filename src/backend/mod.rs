//! Backend exchange strategies.
//!
//! One module per backend kind: handler dispatch over the messaging
//! transport, static directory serving, and upstream proxy relay. The
//! connection state machine orchestrates these; each module owns the byte
//! mechanics of its exchange.

pub mod dir;
pub mod handler;
pub mod proxy;
