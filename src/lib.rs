//! Userspace TCP protocol engine over a TUN device (spec S1 overview).
//!
//! The engine occupies the position a kernel's TCP/IP stack would: sockets
//! are opened against a [`tcp::NetStack`], not against the OS. Wire framing,
//! the state machine, and the socket API live under [`tcp`]; this crate root
//! only wires configuration and the error type together the way the
//! teacher's `lib.rs` wired `Manager`/`NetStack` directly, before those grew
//! into their own module.

mod config;
pub use config::*;

mod err;
pub use err::*;

mod tcp;
pub use tcp::{Dual, NetStack, Quad, State, TcpListener, TcpStream};
