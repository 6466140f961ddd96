#![forbid(unsafe_code)]
//! Async client for the SWI-Prolog Machine Query Interface (MQI).
//!
//! Launches (or attaches to) a Prolog server speaking the MQI wire protocol
//! (length-prefixed frames carrying logic-term messages over loopback TCP or
//! a Unix domain socket) and drives queries against it.
//!
//! ## Setup
//! - [`PrologServer::builder`] configures the launch: interpreter path
//!   (defaults to `PROLOG_PATH` or `swipl`), endpoint (pinned TCP port, Unix
//!   socket path, or generated), password (generated unless supplied), an
//!   optional server-side default query timeout, trace forwarding, and
//!   output capture. With `.launch_mqi(false)` the builder attaches to an
//!   already-running server instead; then the endpoint and password are
//!   required.
//! - [`PrologServer::create_session`] opens one connection and performs the
//!   password handshake. Sessions are independent; the server runs each one
//!   on its own goal thread, so open several for parallel work.
//!
//! ```rust,no_run
//! use prolog_mqi::PrologServer;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = PrologServer::builder().start().await?;
//! let mut session = server.create_session().await?;
//! let answer = session.query("member(X, [a, b])").await?;
//! println!("{answer:?}");
//! server.stop().await;
//! # Ok(()) }
//! ```
//!
//! ## Queries
//! - [`PrologSession::query`] runs a goal to completion and returns every
//!   solution at once; heartbeats emitted by the server during long goals
//!   are consumed transparently (see [`PrologSession::heartbeat_count`]).
//! - [`PrologSession::query_async`] submits a goal and returns immediately;
//!   [`PrologSession::query_async_result`] then retrieves the answers,
//!   either all at once (`find_all`) or one solution per call, ending with
//!   `None`. [`PrologSession::query_async_result_within`] polls with a
//!   bounded wait, and [`PrologSession::cancel_query_async`] aborts the
//!   pending goal; drain the remaining results to observe the cancellation.
//! - One query is in flight per session at a time. Submitting a new query
//!   over a pending one cancels the old query first.
//!
//! Answers decode into [`Term`] values; a term's `Display` form is the
//! canonical source text, accepted back by the server, with decoded
//! variables renamed to `A`, `B`, …. Errors carry the server's exception
//! term; match on it with [`PrologError::is_prolog_exception`] or on the
//! variant via [`PrologError::kind`].

mod defaults;
mod error;
mod frame;
mod server;
mod session;
mod term;

pub use error::{ErrorKind, PrologError};
pub use frame::ServerEndpoint;
pub use server::{PrologServer, PrologServerBuilder};
pub use session::{Bindings, PrologSession, QueryResult};
pub use term::{Term, TermDecodeError};

#[cfg(test)]
mod tests;
