//! Userspace TCP engine (spec S2 overview). Module layout follows the
//! layering the engine is built in: sequence arithmetic and wire codec at
//! the bottom, the per-connection state machine (`tcb`) on top of those, the
//! registry/worker (`manager`) tying connections to the link, and the public
//! socket API (`listen`, `stream`) on top of that.

pub mod codec;
pub mod congestion;
mod link;
pub mod listen;
mod manager;
pub mod options;
pub mod pool;
pub mod recv;
pub mod send;
pub mod seq;
pub mod stream;
pub mod tcb;

pub use listen::TcpListener;
pub use manager::NetStack;
pub use stream::TcpStream;
pub use tcb::{Dual, Quad, State};
