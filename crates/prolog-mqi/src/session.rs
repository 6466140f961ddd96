use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PrologError;
use crate::frame::{FrameStream, ServerEndpoint};
use crate::term::{Term, VariableNamer};

/// One solution's variable assignments.
pub type Bindings = BTreeMap<String, Term>;

/// Outcome of a query.
///
/// `True` is a single success with no free variables. A solution that binds
/// nothing (possible when a goal with no free variables succeeds more than
/// once) appears as an empty map inside `Bindings`.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    True,
    False,
    Bindings(Vec<Bindings>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SessionState {
    Idle,
    SyncPending,
    AsyncPending { find_all: bool, cancelled: bool },
    AsyncDrained,
    Closed,
    Broken,
}

enum Reply {
    True(Vec<Bindings>),
    False,
    Exception(Term),
}

/// One connection to the server and its single query channel.
///
/// A session executes one query at a time. Submitting a new query while an
/// asynchronous one is pending cancels the pending query first; results
/// visible afterwards belong to the new query only. Operations that make no
/// sense in the current state (fetching results with nothing pending,
/// cancelling twice) fail with a `no_query` error without touching the
/// socket. For parallel queries, open more sessions via
/// [`crate::PrologServer::create_session`].
#[derive(Debug)]
pub struct PrologSession {
    frames: Option<FrameStream>,
    state: SessionState,
    goal_thread_id: Option<String>,
    communication_thread_id: Option<String>,
    heartbeats_at_close: u64,
}

impl PrologSession {
    /// Connects to `endpoint` and performs the password handshake.
    pub async fn connect(
        endpoint: &ServerEndpoint,
        password: &str,
    ) -> Result<Self, PrologError> {
        let mut frames = FrameStream::connect(endpoint)
            .await
            .map_err(|err| PrologError::connection_failed(err.to_string()))?;
        frames
            .send(&format!("{password}."))
            .await
            .map_err(|err| PrologError::connection_failed(err.to_string()))?;
        let reply = frames
            .recv()
            .await
            .map_err(|err| PrologError::connection_failed(err.to_string()))?;

        let value: Value = serde_json::from_str(&reply)
            .map_err(|err| PrologError::connection_failed(format!("handshake reply: {err}")))?;
        let term = Term::from_json(&value)
            .map_err(|err| PrologError::connection_failed(format!("handshake reply: {err}")))?;
        if term.name() == "exception" {
            let inner = term.args().first().cloned().unwrap_or(term);
            return Err(PrologError::ConnectionFailed { term: inner });
        }
        let (goal_id, comm_id) = find_thread_pair(&term).ok_or_else(|| {
            PrologError::connection_failed(format!("unrecognized handshake reply: {term}"))
        })?;
        debug!(goal_id = %goal_id, comm_id = %comm_id, %endpoint, "session established");

        Ok(Self {
            frames: Some(frames),
            state: SessionState::Idle,
            goal_thread_id: Some(goal_id),
            communication_thread_id: Some(comm_id),
            heartbeats_at_close: 0,
        })
    }

    /// Server-side id of the thread running this session's goals.
    pub fn goal_thread_id(&self) -> Option<&str> {
        self.goal_thread_id.as_deref()
    }

    /// Server-side id of the thread servicing this session's socket.
    pub fn communication_thread_id(&self) -> Option<&str> {
        self.communication_thread_id.as_deref()
    }

    /// Heartbeat markers consumed so far; grows while long queries run.
    pub fn heartbeat_count(&self) -> u64 {
        self.frames
            .as_ref()
            .map_or(self.heartbeats_at_close, FrameStream::heartbeat_count)
    }

    /// Runs `goal` synchronously with the server's default timeout, blocking
    /// until the terminal reply (heartbeats are consumed along the way).
    pub async fn query(&mut self, goal: &str) -> Result<QueryResult, PrologError> {
        self.run_sync(goal, None).await
    }

    /// Runs `goal` synchronously, failing with a timeout error if the server
    /// does not finish it within `timeout`.
    pub async fn query_with_timeout(
        &mut self,
        goal: &str,
        timeout: Duration,
    ) -> Result<QueryResult, PrologError> {
        self.run_sync(goal, Some(timeout)).await
    }

    /// Submits `goal` without waiting for answers. With `find_all` the
    /// eventual single result carries every solution; without it each
    /// [`Self::query_async_result`] call retrieves one solution.
    ///
    /// Submission errors (a goal that does not parse, for instance) are
    /// reported here; evaluation errors arrive with the results.
    pub async fn query_async(&mut self, goal: &str, find_all: bool) -> Result<(), PrologError> {
        self.run_async(goal, None, find_all).await
    }

    /// [`Self::query_async`] with an explicit per-query timeout.
    pub async fn query_async_with_timeout(
        &mut self,
        goal: &str,
        timeout: Duration,
        find_all: bool,
    ) -> Result<(), PrologError> {
        self.run_async(goal, Some(timeout), find_all).await
    }

    /// Retrieves the next result of the pending asynchronous query, waiting
    /// as long as it takes. `None` means the solutions are exhausted.
    pub async fn query_async_result(&mut self) -> Result<Option<QueryResult>, PrologError> {
        self.async_result(None).await
    }

    /// Like [`Self::query_async_result`] but gives up after `wait`, failing
    /// with [`crate::ErrorKind::ResultNotAvailable`] if nothing is ready yet.
    /// A zero `wait` polls. The query stays pending either way.
    pub async fn query_async_result_within(
        &mut self,
        wait: Duration,
    ) -> Result<Option<QueryResult>, PrologError> {
        self.async_result(Some(wait)).await
    }

    /// Cancels the pending asynchronous query. The server resolves the
    /// cancel with a terminal reply: keep draining via
    /// [`Self::query_async_result`] until the already-buffered solutions run
    /// out and the `cancel_goal` error (or the query's own terminal error)
    /// surfaces. A second cancel, or a cancel with nothing pending, fails
    /// with `no_query` without touching the socket.
    pub async fn cancel_query_async(&mut self) -> Result<(), PrologError> {
        match self.state {
            SessionState::AsyncPending {
                find_all,
                cancelled: false,
            } => {
                self.send_message("cancel_async.").await?;
                match self.recv_reply().await? {
                    Reply::True(_) => {
                        self.state = SessionState::AsyncPending {
                            find_all,
                            cancelled: true,
                        };
                        Ok(())
                    }
                    Reply::False => Err(self.fail("unexpected reply to a cancel")),
                    Reply::Exception(term) => {
                        let error = self.exception_error(term);
                        if matches!(error, PrologError::NoQuery { .. }) {
                            // The server already resolved the query.
                            self.state = SessionState::Idle;
                        }
                        Err(error)
                    }
                }
            }
            SessionState::AsyncPending { cancelled: true, .. }
            | SessionState::Idle
            | SessionState::AsyncDrained
            | SessionState::SyncPending => Err(PrologError::no_query()),
            SessionState::Closed | SessionState::Broken => Err(self.unusable()),
        }
    }

    /// Cancels any pending query best-effort, announces `close.`, and shuts
    /// the socket down. The session is unusable afterwards.
    pub async fn close(&mut self) -> Result<(), PrologError> {
        if let Some(mut frames) = self.frames.take() {
            if !matches!(self.state, SessionState::Broken) {
                if matches!(self.state, SessionState::AsyncPending { .. }) {
                    let _ = frames.send("cancel_async.").await;
                    let _ = frames.recv().await;
                }
                let _ = frames.send("close.").await;
                let _ = frames.recv().await;
            }
            frames.shutdown().await;
            self.heartbeats_at_close = frames.heartbeat_count();
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Asks the server process to halt. Used by the supervisor's teardown;
    /// the reply (if the server lives long enough to send one) is discarded.
    pub async fn halt_server(&mut self) -> Result<(), PrologError> {
        if matches!(self.state, SessionState::Closed | SessionState::Broken) {
            return Err(self.unusable());
        }
        self.send_message("halt.").await?;
        if let Some(mut frames) = self.frames.take() {
            let _ = frames.recv().await;
            frames.shutdown().await;
            self.heartbeats_at_close = frames.heartbeat_count();
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    async fn run_sync(
        &mut self,
        goal: &str,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, PrologError> {
        self.abandon_pending_async().await?;
        let message = format!(
            "run(({}), {}).",
            clean_goal(goal),
            timeout_argument(timeout)
        );
        self.state = SessionState::SyncPending;
        self.send_message(&message).await?;
        let reply = self.recv_reply().await?;
        self.state = SessionState::Idle;
        match reply {
            Reply::True(answers) => Ok(shape_result(answers)),
            Reply::False => Ok(QueryResult::False),
            Reply::Exception(term) => Err(self.exception_error(term)),
        }
    }

    async fn run_async(
        &mut self,
        goal: &str,
        timeout: Option<Duration>,
        find_all: bool,
    ) -> Result<(), PrologError> {
        self.abandon_pending_async().await?;
        let message = format!(
            "run_async(({}), {}, {}).",
            clean_goal(goal),
            timeout_argument(timeout),
            find_all
        );
        self.send_message(&message).await?;
        match self.recv_reply().await? {
            Reply::True(_) => {
                self.state = SessionState::AsyncPending {
                    find_all,
                    cancelled: false,
                };
                Ok(())
            }
            Reply::False => Err(self.fail("unexpected reply to a submission")),
            Reply::Exception(term) => {
                self.state = SessionState::Idle;
                Err(self.exception_error(term))
            }
        }
    }

    async fn async_result(
        &mut self,
        wait: Option<Duration>,
    ) -> Result<Option<QueryResult>, PrologError> {
        let find_all = match self.state {
            SessionState::AsyncPending { find_all, .. } => find_all,
            SessionState::Idle | SessionState::AsyncDrained | SessionState::SyncPending => {
                return Err(PrologError::no_query());
            }
            SessionState::Closed | SessionState::Broken => return Err(self.unusable()),
        };
        let message = format!("async_result({}).", wait_argument(wait));
        self.send_message(&message).await?;
        match self.recv_reply().await? {
            Reply::True(answers) => {
                if find_all {
                    self.state = SessionState::Idle;
                }
                Ok(Some(shape_result(answers)))
            }
            Reply::False => {
                self.state = SessionState::AsyncDrained;
                Ok(None)
            }
            Reply::Exception(term) => {
                let error = PrologError::from_exception(term);
                match &error {
                    // The query is still pending; only this fetch timed out.
                    PrologError::ResultNotAvailable { .. } => {}
                    PrologError::ConnectionFailed { .. } => self.state = SessionState::Broken,
                    _ => self.state = SessionState::Idle,
                }
                Err(error)
            }
        }
    }

    /// A new submission while an async query is pending cancels the old
    /// query first, consuming the cancel's reply to keep the stream aligned.
    async fn abandon_pending_async(&mut self) -> Result<(), PrologError> {
        match self.state {
            SessionState::AsyncPending { .. } => {
                debug!("cancelling pending async query before new submission");
                self.send_message("cancel_async.").await?;
                let _ = self.recv_reply().await?;
                self.state = SessionState::Idle;
                Ok(())
            }
            SessionState::Closed | SessionState::Broken => Err(self.unusable()),
            _ => Ok(()),
        }
    }

    async fn send_message(&mut self, message: &str) -> Result<(), PrologError> {
        let frames = match self.frames.as_mut() {
            Some(frames) => frames,
            None => return Err(self.unusable()),
        };
        if let Err(err) = frames.send(message).await {
            warn!(%err, "send failed; marking session broken");
            self.state = SessionState::Broken;
            return Err(PrologError::connection_failed(err.to_string()));
        }
        Ok(())
    }

    async fn recv_reply(&mut self) -> Result<Reply, PrologError> {
        let frames = match self.frames.as_mut() {
            Some(frames) => frames,
            None => return Err(self.unusable()),
        };
        let payload = match frames.recv().await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "receive failed; marking session broken");
                self.state = SessionState::Broken;
                return Err(PrologError::connection_failed(err.to_string()));
            }
        };
        match decode_reply(&payload) {
            Ok(reply) => Ok(reply),
            Err(reason) => Err(self.fail(reason)),
        }
    }

    /// Maps a terminal `exception(...)` onto the taxonomy; a reported
    /// connection failure also poisons the session.
    fn exception_error(&mut self, term: Term) -> PrologError {
        let error = PrologError::from_exception(term);
        if matches!(error, PrologError::ConnectionFailed { .. }) {
            self.state = SessionState::Broken;
        }
        error
    }

    fn fail(&mut self, reason: impl Into<String>) -> PrologError {
        let reason = reason.into();
        warn!(%reason, "protocol fault; marking session broken");
        self.state = SessionState::Broken;
        PrologError::connection_failed(reason)
    }

    fn unusable(&self) -> PrologError {
        match self.state {
            SessionState::Broken => PrologError::connection_failed("session is broken"),
            _ => PrologError::connection_failed("session is closed"),
        }
    }
}

impl Drop for PrologSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        let pending = matches!(
            self.state,
            SessionState::AsyncPending { .. } | SessionState::SyncPending
        );
        if let Some(mut frames) = self.frames.take() {
            // Closing the socket aborts the remote goal on its own; saying
            // goodbye first is best-effort and needs a live runtime.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if pending {
                        let _ = frames.send("cancel_async.").await;
                    }
                    let _ = frames.send("close.").await;
                    frames.shutdown().await;
                });
            }
        }
    }
}

fn clean_goal(goal: &str) -> &str {
    goal.trim().trim_end_matches('.').trim_end()
}

fn timeout_argument(timeout: Option<Duration>) -> String {
    match timeout {
        // The server falls back to the timeout configured at startup.
        None => "_".to_string(),
        Some(timeout) => format!("{}", timeout.as_secs_f64()),
    }
}

fn wait_argument(wait: Option<Duration>) -> String {
    match wait {
        // Negative means block until a result exists.
        None => "-1".to_string(),
        Some(wait) => format!("{}", wait.as_secs_f64()),
    }
}

fn shape_result(answers: Vec<Bindings>) -> QueryResult {
    if answers.len() == 1 && answers[0].is_empty() {
        QueryResult::True
    } else {
        QueryResult::Bindings(answers)
    }
}

fn decode_reply(payload: &str) -> Result<Reply, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|err| format!("reply is not JSON: {err}"))?;
    let name = value
        .as_str()
        .or_else(|| value.get("functor").and_then(Value::as_str))
        .ok_or_else(|| format!("reply has no recognizable envelope: {value}"))?;
    match name {
        "true" => {
            let args = value
                .get("args")
                .and_then(Value::as_array)
                .ok_or("true envelope without arguments")?;
            Ok(Reply::True(decode_answers(args)?))
        }
        "false" => Ok(Reply::False),
        "exception" => {
            let inner = value
                .get("args")
                .and_then(Value::as_array)
                .and_then(|args| args.first())
                .ok_or("exception envelope without a term")?;
            let term = Term::from_json(inner).map_err(|err| err.to_string())?;
            Ok(Reply::Exception(term))
        }
        other => Err(format!("unexpected envelope functor: {other}")),
    }
}

/// Decodes `true(Answers)` where each answer is a list of `=(Name, Value)`
/// assignments. Variable canonicalization is scoped to one answer.
fn decode_answers(args: &[Value]) -> Result<Vec<Bindings>, String> {
    let answers = args
        .first()
        .and_then(Value::as_array)
        .ok_or("true envelope without an answer list")?;
    let mut decoded = Vec::with_capacity(answers.len());
    for answer in answers {
        let assignments = answer
            .as_array()
            .ok_or_else(|| format!("answer is not an assignment list: {answer}"))?;
        let mut namer = VariableNamer::default();
        let mut bindings = Bindings::new();
        for assignment in assignments {
            let functor = assignment.get("functor").and_then(Value::as_str);
            let pair = assignment.get("args").and_then(Value::as_array);
            let (name, value) = match (functor, pair) {
                (Some("="), Some(pair)) if pair.len() == 2 => {
                    match pair[0].as_str() {
                        Some(name) => (name, &pair[1]),
                        None => {
                            return Err(format!("assignment names a non-string: {assignment}"))
                        }
                    }
                }
                _ => return Err(format!("answer entry is not an assignment: {assignment}")),
            };
            let term = Term::from_json_with(value, &mut namer).map_err(|err| err.to_string())?;
            bindings.insert(name.to_string(), term);
        }
        decoded.push(bindings);
    }
    Ok(decoded)
}

/// Finds the `thread(GoalId, CommId)` pair in a handshake reply, whether the
/// server sent the compound bare or inside the usual `true([[...]])`
/// envelope.
fn find_thread_pair(term: &Term) -> Option<(String, String)> {
    match term {
        Term::Compound { functor, args } if functor == "thread" && args.len() == 2 => {
            match (&args[0], &args[1]) {
                (Term::Atom(goal), Term::Atom(comm)) => Some((goal.clone(), comm.clone())),
                _ => None,
            }
        }
        Term::Compound { args, .. } => args.iter().find_map(find_thread_pair),
        Term::List(items) => items.iter().find_map(find_thread_pair),
        _ => None,
    }
}
