//! `ccrpc`: a minimal, symmetric, bidirectional call/return/call-back
//! protocol engine running over any pair of byte streams.
//!
//! There is no client or server role: either side of a [`Connection`] can
//! initiate a call, answer one, or issue a nested call-back while handling
//! one. Transport setup (dialing, accepting, spawning a subprocess,
//! wrapping TLS) is left entirely to the caller. A `Connection` is built
//! from anything that is [`Read`](std::io::Read) + [`Write`](std::io::Write)
//! + `Send`, or conveniently from a `TcpStream`.
//!
//! ```no_run
//! use ccrpc::{call::HandlerAction, connection::{Connection, ConnectionOptions}, bag::Params};
//! use std::net::TcpStream;
//!
//! # fn main() -> std::io::Result<()> {
//! let conn = Connection::from_tcp_stream(TcpStream::connect("127.0.0.1:9000")?, ConnectionOptions::default())?;
//! let mut params = Params::new();
//! params.insert("name", "world");
//! let answer = conn.call("greet", params, None);
//! # Ok(())
//! # }
//! ```

pub mod bag;
pub mod call;
pub mod connection;
pub mod error;
pub mod escape;
pub mod frame;
pub mod negotiate;
pub mod promise;


pub use bag::Params;
pub use call::{Call, CallHandler, HandlerAction};
pub use connection::{Answer, Connection, ConnectionHandle, ConnectionOptions};
pub use error::{Result, RpcError};
pub use negotiate::Protocol;
pub use promise::LazyAnswer;
