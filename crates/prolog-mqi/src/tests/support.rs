use std::fs as std_fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::{PrologSession, ServerEndpoint};

pub(super) const PASSWORD: &str = "testpassword";

static TMPDIR_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

/// Serializes tests that rewrite `TMPDIR`.
pub(super) async fn tmpdir_lock() -> tokio::sync::MutexGuard<'static, ()> {
    TMPDIR_LOCK
        .get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

/// One scripted exchange on the fake server's side of the socket.
pub(super) enum Step {
    /// Read a frame and assert its trimmed payload equals this message.
    Expect(&'static str),
    /// Send a framed reply with this payload.
    Reply(String),
    /// Send this many raw heartbeat bytes ahead of the next frame.
    Heartbeats(usize),
    /// Drop the connection immediately.
    Hangup,
}

/// In-process stand-in for the server: accepts scripted connections on a
/// loopback port, runs the password handshake, then plays its step list.
/// Assertion failures surface when the test awaits [`FakeServer::finish`].
pub(super) struct FakeServer {
    pub(super) port: u16,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub(super) async fn start(steps: Vec<Step>) -> Self {
        Self::start_connections(vec![steps]).await
    }

    pub(super) async fn start_connections(connections: Vec<Vec<Step>>) -> Self {
        Self::start_inner(handshake_reply().to_string(), connections).await
    }

    pub(super) async fn start_with_handshake(handshake: String, steps: Vec<Step>) -> Self {
        Self::start_inner(handshake, vec![steps]).await
    }

    async fn start_inner(handshake: String, connections: Vec<Vec<Step>>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let handle = tokio::spawn(async move {
            for steps in connections {
                let (stream, _) = listener.accept().await.expect("accept");
                serve_connection(stream, &handshake, steps).await;
            }
        });
        Self { port, handle }
    }

    pub(super) fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::Tcp { port: self.port }
    }

    /// Waits for every scripted connection to finish, surfacing any
    /// assertion failure from the server task.
    pub(super) async fn finish(self) {
        self.handle.await.expect("fake server failed");
    }
}

async fn serve_connection(stream: TcpStream, handshake: &str, steps: Vec<Step>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let password = read_frame(&mut reader).await.expect("password frame");
    assert_eq!(password.trim(), format!("{PASSWORD}."));
    write_frame(&mut write, handshake).await;
    for step in steps {
        match step {
            Step::Expect(message) => {
                let received = read_frame(&mut reader)
                    .await
                    .unwrap_or_else(|| panic!("connection ended awaiting `{message}`"));
                assert_eq!(received.trim(), message);
            }
            Step::Reply(payload) => write_frame(&mut write, &payload).await,
            Step::Heartbeats(count) => {
                for _ in 0..count {
                    write.write_all(b".").await.expect("heartbeat");
                }
                write.flush().await.expect("flush heartbeats");
            }
            Step::Hangup => return,
        }
    }
}

/// Reads one client frame; `None` on a closed connection.
pub(super) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Option<String> {
    let mut length: usize = 0;
    let mut seen_digit = false;
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(_) => return None,
        };
        match byte {
            b'0'..=b'9' => {
                seen_digit = true;
                length = length * 10 + usize::from(byte - b'0');
            }
            b'.' if seen_digit => {
                let newline = reader.read_u8().await.ok()?;
                assert_eq!(newline, b'\n', "missing newline after frame header");
                let mut payload = vec![0u8; length];
                reader.read_exact(&mut payload).await.ok()?;
                return Some(String::from_utf8(payload).expect("frame payload utf-8"));
            }
            other => panic!("unexpected byte in client frame header: 0x{other:02x}"),
        }
    }
}

pub(super) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) {
    let frame = format!("{}.\n{}", payload.len(), payload);
    writer.write_all(frame.as_bytes()).await.expect("write frame");
    writer.flush().await.expect("flush frame");
}

pub(super) async fn connect(server: &FakeServer) -> PrologSession {
    PrologSession::connect(&server.endpoint(), PASSWORD)
        .await
        .expect("handshake")
}

pub(super) fn handshake_reply() -> Value {
    json!({"functor": "true", "args": [[[{"functor": "thread", "args": ["goal_1", "comm_1"]}]]]})
}

/// `true([[]])`: a bare acknowledgement / no-free-variable success.
pub(super) fn ok_reply() -> String {
    json!({"functor": "true", "args": [[[]]]}).to_string()
}

pub(super) fn true_reply(answers: Value) -> String {
    json!({"functor": "true", "args": [answers]}).to_string()
}

pub(super) fn false_reply() -> String {
    json!("false").to_string()
}

pub(super) fn exception_reply(inner: Value) -> String {
    json!({"functor": "exception", "args": [inner]}).to_string()
}

pub(super) fn assignment(name: &str, value: Value) -> Value {
    json!({"functor": "=", "args": [name, value]})
}

pub(super) fn write_fake_swipl(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("swipl");
    std_fs::write(&path, script).unwrap();
    let mut perms = std_fs::metadata(&path).unwrap().permissions();
    #[cfg(unix)]
    {
        perms.set_mode(0o755);
    }
    std_fs::set_permissions(&path, perms).unwrap();
    path
}
