use thiserror::Error;

use crate::term::Term;

/// Errors surfaced while launching, connecting to, or querying the server.
///
/// Remote exceptions carry the server's exception term verbatim; use
/// [`PrologError::prolog`] to inspect it or
/// [`PrologError::is_prolog_exception`] to match its functor (e.g.
/// `syntax_error`, `existence_error`).
#[derive(Debug, Error)]
pub enum PrologError {
    /// The server process failed to start or never produced its
    /// port/password stdout lines.
    #[error("failed to launch the prolog server: {reason}")]
    Launch { reason: String },
    /// Invalid option combination detected before any side effect.
    #[error("invalid server configuration: {reason}")]
    Config { reason: String },
    /// The transport failed mid-transaction or the server reported
    /// `connection_failed`. The session is unusable afterwards.
    #[error("connection to the server failed: {term}")]
    ConnectionFailed { term: Term },
    /// The server reported `time_limit_exceeded` for the running query.
    #[error("query exceeded its time limit: {term}")]
    QueryTimeout { term: Term },
    /// The server reported `cancel_goal` after a client cancel.
    #[error("query was cancelled: {term}")]
    QueryCancelled { term: Term },
    /// An operation that requires a pending query was issued without one, or
    /// a cancel was repeated.
    #[error("no query is in progress: {term}")]
    NoQuery { term: Term },
    /// `query_async_result` with a zero (or elapsed) wait found nothing
    /// buffered yet. The query is still pending.
    #[error("no result is available yet: {term}")]
    ResultNotAvailable { term: Term },
    /// Any other exception raised by the query, carried verbatim.
    #[error("the query raised an exception: {term}")]
    Prolog { term: Term },
}

/// Discriminates [`PrologError`] variants without matching on payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Launch,
    Config,
    ConnectionFailed,
    QueryTimeout,
    QueryCancelled,
    NoQuery,
    ResultNotAvailable,
    Prolog,
}

impl PrologError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrologError::Launch { .. } => ErrorKind::Launch,
            PrologError::Config { .. } => ErrorKind::Config,
            PrologError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            PrologError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            PrologError::QueryCancelled { .. } => ErrorKind::QueryCancelled,
            PrologError::NoQuery { .. } => ErrorKind::NoQuery,
            PrologError::ResultNotAvailable { .. } => ErrorKind::ResultNotAvailable,
            PrologError::Prolog { .. } => ErrorKind::Prolog,
        }
    }

    /// The exception term carried by this error, when there is one.
    pub fn prolog(&self) -> Option<&Term> {
        match self {
            PrologError::Launch { .. } | PrologError::Config { .. } => None,
            PrologError::ConnectionFailed { term }
            | PrologError::QueryTimeout { term }
            | PrologError::QueryCancelled { term }
            | PrologError::NoQuery { term }
            | PrologError::ResultNotAvailable { term }
            | PrologError::Prolog { term } => Some(term),
        }
    }

    /// True when the carried exception term's principal functor is `name`.
    pub fn is_prolog_exception(&self, name: &str) -> bool {
        self.prolog().is_some_and(|term| term.name() == name)
    }

    /// Maps the inner term of a server `exception(...)` envelope onto the
    /// taxonomy by its principal functor.
    pub(crate) fn from_exception(term: Term) -> PrologError {
        match term.name().as_str() {
            "time_limit_exceeded" => PrologError::QueryTimeout { term },
            "cancel_goal" => PrologError::QueryCancelled { term },
            "no_query" => PrologError::NoQuery { term },
            "result_not_available" => PrologError::ResultNotAvailable { term },
            "connection_failed" => PrologError::ConnectionFailed { term },
            _ => PrologError::Prolog { term },
        }
    }

    /// A `ConnectionFailed` for a local transport fault, with a synthesized
    /// `connection_failed(Reason)` term so functor matching stays uniform.
    pub(crate) fn connection_failed(reason: impl Into<String>) -> PrologError {
        PrologError::ConnectionFailed {
            term: Term::compound("connection_failed", vec![Term::atom(reason.into())]),
        }
    }

    /// A client-side `NoQuery`, raised without touching the socket.
    pub(crate) fn no_query() -> PrologError {
        PrologError::NoQuery {
            term: Term::atom("no_query"),
        }
    }
}
