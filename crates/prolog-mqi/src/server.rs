use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::defaults::{
    default_prolog_path, MAX_SOCKET_PATH_BYTES, SHUTDOWN_TIMEOUT, STARTUP_TIMEOUT,
};
use crate::error::PrologError;
use crate::frame::ServerEndpoint;
use crate::session::PrologSession;
use crate::term::Term;

/// Configures and starts a [`PrologServer`].
///
/// By default the server process is launched locally with a generated
/// password and a TCP port of the server's choosing. Call
/// [`Self::launch_mqi`] with `false` to attach to a server something else
/// already started, in which case the endpoint and password must be supplied.
#[derive(Clone, Debug)]
pub struct PrologServerBuilder {
    launch_mqi: bool,
    port: Option<u16>,
    password: Option<String>,
    unix_domain_socket: Option<PathBuf>,
    output_file: Option<PathBuf>,
    mqi_traces: Option<String>,
    query_timeout: Option<Duration>,
    prolog_path: Option<PathBuf>,
    prolog_args: Vec<String>,
    startup_timeout: Duration,
}

impl Default for PrologServerBuilder {
    fn default() -> Self {
        Self {
            launch_mqi: true,
            port: None,
            password: None,
            unix_domain_socket: None,
            output_file: None,
            mqi_traces: None,
            query_timeout: None,
            prolog_path: None,
            prolog_args: Vec::new(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }
}

impl PrologServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to launch the server process (the default) or attach to one
    /// that is already listening.
    pub fn launch_mqi(mut self, launch: bool) -> Self {
        self.launch_mqi = launch;
        self
    }

    /// Pins the TCP port. When launching without a pinned port the server
    /// picks one and reports it on stdout. Mutually exclusive with
    /// [`Self::unix_domain_socket`].
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the connection password. Required when attaching to an existing
    /// server; generated when launching without one.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Connects over a Unix domain socket at `path` instead of TCP. An empty
    /// path asks the builder to generate one under a fresh temporary
    /// directory that is removed again on teardown. Unix only.
    pub fn unix_domain_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_domain_socket = Some(path.into());
        self
    }

    /// Redirects the launched server's output into `file` (it still prints
    /// its connection values first). Only valid when launching.
    pub fn output_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.output_file = Some(file.into());
        self
    }

    /// Forwards an opaque trace specification to the launched server.
    pub fn mqi_traces(mut self, traces: impl Into<String>) -> Self {
        self.mqi_traces = Some(traces.into());
        self
    }

    /// Default per-query timeout configured at server startup. Queries
    /// submitted without an explicit timeout fall back to this.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Path to the interpreter binary. Defaults to `PROLOG_PATH` when set,
    /// `swipl` on `PATH` otherwise.
    pub fn prolog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prolog_path = Some(path.into());
        self
    }

    /// Extra arguments placed before the startup goal.
    pub fn prolog_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prolog_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How long to wait for the launched server's connection values.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Validates the configuration, launches the server when asked to, and
    /// learns the endpoint and password from its first two stdout lines.
    pub async fn start(self) -> Result<PrologServer, PrologError> {
        self.validate()?;
        if !self.launch_mqi {
            let endpoint = self.existing_endpoint()?;
            let password = self.password.clone().unwrap_or_default();
            debug!(%endpoint, "attaching to an existing server");
            return Ok(PrologServer {
                endpoint,
                password,
                process: None,
                socket_path: None,
                socket_dir: None,
                drain_tasks: Vec::new(),
                stopped: false,
            });
        }
        self.launch().await
    }

    fn validate(&self) -> Result<(), PrologError> {
        if self.port.is_some() && self.unix_domain_socket.is_some() {
            return Err(PrologError::Config {
                reason: "port and unix_domain_socket are mutually exclusive".into(),
            });
        }
        if cfg!(not(unix)) && self.unix_domain_socket.is_some() {
            return Err(PrologError::Config {
                reason: "unix domain sockets are not supported on this platform".into(),
            });
        }
        if self.output_file.is_some() && !self.launch_mqi {
            return Err(PrologError::Config {
                reason: "output_file requires launching the server".into(),
            });
        }
        if self.launch_mqi
            && self
                .unix_domain_socket
                .as_deref()
                .is_some_and(|path| path.as_os_str().is_empty())
            && !generated_socket_path_fits(&std::env::temp_dir())
        {
            return Err(PrologError::Config {
                reason: format!(
                    "a socket path generated under {} would exceed the \
                     {MAX_SOCKET_PATH_BYTES}-byte socket path limit",
                    std::env::temp_dir().display()
                ),
            });
        }
        if !self.launch_mqi {
            if self.port.is_none() && self.unix_domain_socket.is_none() {
                return Err(PrologError::Config {
                    reason: "attaching to an existing server requires a port or socket path"
                        .into(),
                });
            }
            if self.password.as_deref().map_or(true, str::is_empty) {
                return Err(PrologError::Config {
                    reason: "attaching to an existing server requires its password".into(),
                });
            }
            if self
                .unix_domain_socket
                .as_deref()
                .is_some_and(|path| path.as_os_str().is_empty())
            {
                return Err(PrologError::Config {
                    reason: "attaching to an existing server requires its socket path".into(),
                });
            }
        }
        Ok(())
    }

    fn existing_endpoint(&self) -> Result<ServerEndpoint, PrologError> {
        if let Some(port) = self.port {
            return Ok(ServerEndpoint::Tcp { port });
        }
        #[cfg(unix)]
        if let Some(path) = &self.unix_domain_socket {
            return Ok(ServerEndpoint::Unix { path: path.clone() });
        }
        Err(PrologError::Config {
            reason: "attaching to an existing server requires a port or socket path".into(),
        })
    }

    async fn launch(self) -> Result<PrologServer, PrologError> {
        let password = self.password.clone().unwrap_or_else(generated_password);

        let mut socket_dir = None;
        let socket_path = match &self.unix_domain_socket {
            None => None,
            Some(path) if !path.as_os_str().is_empty() => Some(path.clone()),
            Some(_) => {
                // validate() already bounded the projected path length.
                let dir = TempDir::new().map_err(|err| PrologError::Launch {
                    reason: format!("could not create a socket directory: {err}"),
                })?;
                let path = dir
                    .path()
                    .join(format!("{}.socket", Uuid::new_v4().simple()));
                socket_dir = Some(dir);
                Some(path)
            }
        };

        let goal = self.startup_goal(&password, socket_path.as_deref());
        let binary = self
            .prolog_path
            .clone()
            .unwrap_or_else(default_prolog_path);
        let mut command = Command::new(&binary);
        command
            .args(&self.prolog_args)
            .arg("--quiet")
            .arg("-g")
            .arg(&goal)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(binary = %binary.display(), %goal, "launching server");

        let mut child = command.spawn().map_err(|source| PrologError::Launch {
            reason: format!("`{}` could not be spawned: {source}", binary.display()),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PrologError::Launch {
            reason: "server stdout unavailable".into(),
        })?;
        let stderr = child.stderr.take();

        let mut lines = BufReader::new(stdout).lines();
        let connection_values = async {
            let first = next_connection_value(&mut lines).await?;
            let second = next_connection_value(&mut lines).await?;
            Ok::<_, PrologError>((first, second))
        };
        let (first, second) = match time::timeout(self.startup_timeout, connection_values).await {
            Ok(values) => values?,
            Err(_) => {
                return Err(PrologError::Launch {
                    reason: format!(
                        "server did not print its connection values within {:?}",
                        self.startup_timeout
                    ),
                });
            }
        };

        let endpoint = match &socket_path {
            #[cfg(unix)]
            Some(path) => ServerEndpoint::Unix { path: path.clone() },
            #[cfg(not(unix))]
            Some(_) => unreachable!("socket paths are rejected during validation"),
            None => {
                let port = first.trim().parse::<u16>().map_err(|_| PrologError::Launch {
                    reason: format!("server printed an unparsable port line: {first:?}"),
                })?;
                ServerEndpoint::Tcp { port }
            }
        };
        let password = second.trim().to_string();
        debug!(%endpoint, "server is listening");

        let mut drain_tasks = vec![tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("server stdout: {line}");
            }
        })];
        if let Some(stderr) = stderr {
            drain_tasks.push(tokio::spawn(drain_stderr(stderr)));
        }

        Ok(PrologServer {
            endpoint,
            password,
            process: Some(child),
            socket_path,
            socket_dir,
            drain_tasks,
            stopped: false,
        })
    }

    /// Renders the `-g` startup goal. Option values go through the term
    /// encoder so passwords and paths with unusual characters stay quoted.
    pub(crate) fn startup_goal(&self, password: &str, socket_path: Option<&Path>) -> String {
        let mut options = Vec::new();
        match socket_path {
            Some(path) => options.push(Term::compound(
                "unix_domain_socket",
                vec![Term::atom(path.to_string_lossy())],
            )),
            None => {
                if let Some(port) = self.port {
                    options.push(Term::compound("port", vec![Term::Integer(i64::from(port))]));
                }
            }
        }
        options.push(Term::compound("password", vec![Term::atom(password)]));
        options.push(Term::compound(
            "server_thread",
            vec![Term::Variable("_".into())],
        ));
        options.push(Term::compound(
            "write_connection_values",
            vec![Term::atom("true")],
        ));
        options.push(Term::compound(
            "run_server_on_thread",
            vec![Term::atom("true")],
        ));
        options.push(Term::compound(
            "halt_on_connection_failure",
            vec![Term::atom("true")],
        ));
        if let Some(timeout) = self.query_timeout {
            options.push(Term::compound(
                "query_timeout",
                vec![Term::Float(timeout.as_secs_f64())],
            ));
        }
        if let Some(traces) = &self.mqi_traces {
            options.push(Term::compound("mqi_traces", vec![Term::atom(traces)]));
        }
        if let Some(file) = &self.output_file {
            options.push(Term::compound(
                "write_output_to_file",
                vec![Term::atom(file.to_string_lossy())],
            ));
        }
        Term::compound("mqi_start", vec![Term::List(options)]).to_string()
    }
}

/// Owns the server endpoint, password, and (when launched locally) the child
/// process and its socket artifacts. Sessions created from one server run
/// truly in parallel; each gets its own goal thread remotely.
#[derive(Debug)]
pub struct PrologServer {
    endpoint: ServerEndpoint,
    password: String,
    process: Option<Child>,
    socket_path: Option<PathBuf>,
    socket_dir: Option<TempDir>,
    drain_tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl PrologServer {
    /// Returns a builder preloaded with defaults.
    pub fn builder() -> PrologServerBuilder {
        PrologServerBuilder::default()
    }

    /// Opens a new connection and runs the handshake against the learned
    /// endpoint and password.
    pub async fn create_session(&self) -> Result<PrologSession, PrologError> {
        PrologSession::connect(&self.endpoint, &self.password).await
    }

    /// Where the server is listening.
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Pid of the launched child, when there is one.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Halts a launched server (best effort), waits a bounded time for it to
    /// exit, kills it if it lingers, and removes any socket artifacts.
    /// Attach-only servers just drop their endpoint.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.process.is_some() {
            match self.create_session().await {
                Ok(mut admin) => {
                    if let Err(err) = admin.halt_server().await {
                        debug!(%err, "halt request failed");
                    }
                }
                Err(err) => debug!(%err, "could not open a session to halt the server"),
            }
            if let Some(mut child) = self.process.take() {
                match time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => debug!(?status, "server exited"),
                    Ok(Err(err)) => warn!(%err, "waiting for the server failed"),
                    Err(_) => {
                        warn!("server did not exit in time; killing it");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
        }
        for task in self.drain_tasks.drain(..) {
            task.abort();
        }
        self.remove_socket_artifacts();
    }

    fn remove_socket_artifacts(&mut self) {
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(&path);
        }
        drop(self.socket_dir.take());
    }
}

impl Drop for PrologServer {
    fn drop(&mut self) {
        for task in self.drain_tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
        }
        self.remove_socket_artifacts();
    }
}

fn generated_password() -> String {
    Uuid::new_v4().simple().to_string()
}

async fn next_connection_value<R: AsyncRead + Unpin>(
    lines: &mut tokio::io::Lines<BufReader<R>>,
) -> Result<String, PrologError> {
    lines
        .next_line()
        .await
        .map_err(|err| PrologError::Launch {
            reason: format!("reading the server's connection values failed: {err}"),
        })?
        .ok_or_else(|| PrologError::Launch {
            reason: "server exited before printing its connection values".into(),
        })
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("server stderr: {line}");
    }
}

/// Whether a socket file generated beneath `temp_dir` stays inside the
/// portable `sun_path` budget: a separator, up to 16 bytes for the
/// temporary directory component, another separator, and the 39-byte
/// `<32 hex>.socket` file name.
pub(crate) fn generated_socket_path_fits(temp_dir: &Path) -> bool {
    const GENERATED_COMPONENT_BYTES: usize = 1 + 16 + 1 + 39;
    temp_dir.as_os_str().len() + GENERATED_COMPONENT_BYTES <= MAX_SOCKET_PATH_BYTES
}
