//! Protocol layer.
//!
//! This module implements the per-connection protocol engine: request
//! parsing and classification, response construction, and the event state
//! machine that sequences a connection from accept to close.
//!
//! # Architecture
//!
//! - **`connection`**: the state machine driving one accepted socket
//! - **`parser`**: parses and classifies buffered request bytes
//! - **`request`**: request representation, header map, close policy
//! - **`response`**: response representation with builder pattern
//! - **`writer`**: serialization and the per-connection write-half task
//! - **`mime`**: content-type detection from file extensions
//!
//! # Connection State Machine
//!
//! Each connection runs a driver loop over named events. Every event maps
//! to one action; the action's return value is the next event, until the
//! terminal close:
//!
//! ```text
//!  Open ─► Accept ─► ReqRecv ─► {HttpReq | MsgReq | SocketReq}
//!                                   │          │         └─► RespSent
//!                                   └── route ─┤
//!                      ┌────────────┬──────────┴─┬─────────┐
//!                   Handler     Directory      Proxy    (no match)
//!                      │            │            │          │
//!                   ReqSent     RespSent      Connect     Close
//!                      │            │            │
//!                      └── parse ◄──┘         ReqSent ─► ReqRecv ─► …
//! ```
//!
//! `RespSent` and the handler-side `ReqSent` loop back to parsing the next
//! request while keep-alive holds. The close action runs exactly once for
//! every connection, whatever path the loop took to get there.

pub mod connection;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
