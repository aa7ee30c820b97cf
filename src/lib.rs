//! Catenis API emulator library
//!
//! A programmable test double for the Catenis REST + WebSocket API: tests
//! install device credentials, a single-shot HTTP expectation, and a
//! notification table over a control-plane listener, then run the client
//! under test against the emulated API listener.

pub mod cli;
pub mod context;
pub mod logging;
pub mod server;
pub mod signer;
