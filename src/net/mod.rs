//! Address and socket primitives: the non-reactor parts of the stack.

mod inet_address;
mod socket;

pub use inet_address::InetAddress;
pub use socket::Socket;
