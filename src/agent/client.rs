//! Guest agent client over the hypervisor's agent socket.
//!
//! ## Framing
//!
//! Requests are newline-terminated JSON. Replies carry no length prefix and
//! no guaranteed terminator, so a reply is read in 1 KiB chunks until the
//! socket stays silent for the quiescence window (or the peer closes). A
//! reply that is slower than the window to arrive in full is cut short and
//! surfaces as `Malformed`.
//!
//! The connection is `&mut self` throughout, so there is never more than one
//! request in flight on a socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::protocol::{AgentRequest, ExecRequest, ExecStatus, ReplyShape, ShutdownMode, Whence, parse_reply};
use crate::error::{ProtocolError, Result, VmError};

/// Default silence that marks the end of a reply.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 1024;

pub struct AgentConnection {
    stream: UnixStream,
    path: PathBuf,
    quiescence: Duration,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("path", &self.path)
            .field("quiescence", &self.quiescence)
            .finish()
    }
}

impl AgentConnection {
    /// Connect to the agent socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VmError::config(
                "agent_socket",
                format!("{} doesn't exist", path.display()),
            ));
        }
        let stream = UnixStream::connect(path).await?;
        debug!(socket = %path.display(), "connected to guest agent");
        Ok(Self {
            stream,
            path: path.to_path_buf(),
            quiescence: DEFAULT_QUIESCENCE,
        })
    }

    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Read chunks until the socket has been silent for the quiescence
    /// window or the peer closed. Returns everything read.
    async fn read_until_quiet(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match timeout(self.quiescence, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(buf)
    }

    /// Write one request and return the parsed reply payload.
    pub async fn send(&mut self, request: &AgentRequest) -> Result<Value> {
        let frame = request.encode()?;
        trace!(command = %request.execute, bytes = frame.len(), "agent request");
        self.stream.write_all(&frame).await?;

        let reply = self.read_until_quiet().await?;
        trace!(command = %request.execute, bytes = reply.len(), "agent reply");
        parse_reply(&reply)
    }

    /// Discard anything already buffered on the socket.
    ///
    /// A closed peer is reported as `Disconnected` so a long-running caller
    /// notices the guest went away.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut discarded = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match timeout(self.quiescence, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ProtocolError::Disconnected.into()),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        if discarded > 0 {
            debug!(bytes = discarded, "drained stale agent output");
        }
        Ok(discarded)
    }

    /// Send and check the payload shape.
    pub async fn call(&mut self, request: AgentRequest, shape: ReplyShape) -> Result<Value> {
        let value = self.send(&request).await?;
        shape.validate(&request.execute, value)
    }

    fn require_user(username: &str) -> Result<()> {
        if username.is_empty() {
            return Err(VmError::config("username", "user name is empty"));
        }
        Ok(())
    }

    async fn call_simple(&mut self, command: &str, shape: ReplyShape) -> Result<Value> {
        self.call(AgentRequest::new(command), shape).await
    }

    async fn call_with(
        &mut self,
        command: &str,
        arguments: Value,
        shape: ReplyShape,
    ) -> Result<Value> {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.call(AgentRequest::with_arguments(command, arguments), shape)
            .await
    }

    // ------------------------------------------------------------------
    // Process execution
    // ------------------------------------------------------------------

    /// Start a program in the guest; returns its pid.
    pub async fn guest_exec(&mut self, request: ExecRequest) -> Result<i64> {
        if request.path.is_empty() {
            return Err(VmError::config("path", "program path is empty"));
        }
        let arguments = request.into_arguments();
        let reply = self
            .call(
                AgentRequest::with_arguments("guest-exec", arguments),
                ReplyShape::Mapping,
            )
            .await?;
        reply
            .get("pid")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::InvalidReply(format!("guest-exec without pid: {reply}")).into())
    }

    pub async fn guest_exec_status(&mut self, pid: i64) -> Result<ExecStatus> {
        let reply = self
            .call_with("guest-exec-status", json!({ "pid": pid }), ReplyShape::Mapping)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Open `path` in the guest; returns the handle.
    pub async fn guest_file_open(&mut self, path: &str, mode: Option<&str>) -> Result<i64> {
        let mut arguments = json!({ "path": path });
        if let Some(mode) = mode {
            arguments["mode"] = mode.into();
        }
        let reply = self
            .call_with("guest-file-open", arguments, ReplyShape::Integer)
            .await?;
        reply
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidReply(format!("bad file handle: {reply}")).into())
    }

    /// Returns the raw mapping (`count`, `buf-b64`, `eof`).
    pub async fn guest_file_read(&mut self, handle: i64, count: Option<u64>) -> Result<Value> {
        let mut arguments = json!({ "handle": handle });
        if let Some(count) = count {
            arguments["count"] = count.into();
        }
        self.call_with("guest-file-read", arguments, ReplyShape::Mapping)
            .await
    }

    /// Write `data` (base64-encoded on the wire).
    pub async fn guest_file_write(
        &mut self,
        handle: i64,
        data: &[u8],
        count: Option<u64>,
    ) -> Result<Value> {
        let mut arguments = json!({ "handle": handle, "buf-b64": STANDARD.encode(data) });
        if let Some(count) = count {
            arguments["count"] = count.into();
        }
        self.call_with("guest-file-write", arguments, ReplyShape::Mapping)
            .await
    }

    pub async fn guest_file_seek(&mut self, handle: i64, offset: i64, whence: Whence) -> Result<Value> {
        self.call_with(
            "guest-file-seek",
            json!({ "handle": handle, "offset": offset, "whence": whence.as_str() }),
            ReplyShape::Mapping,
        )
        .await
    }

    pub async fn guest_file_flush(&mut self, handle: i64) -> Result<()> {
        self.call_with("guest-file-flush", json!({ "handle": handle }), ReplyShape::Mapping)
            .await?;
        Ok(())
    }

    pub async fn guest_file_close(&mut self, handle: i64) -> Result<()> {
        self.call_with("guest-file-close", json!({ "handle": handle }), ReplyShape::Mapping)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn guest_get_host_name(&mut self) -> Result<Value> {
        self.call_simple("guest-get-host-name", ReplyShape::Mapping).await
    }

    pub async fn guest_get_osinfo(&mut self) -> Result<Value> {
        self.call_simple("guest-get-osinfo", ReplyShape::Mapping).await
    }

    pub async fn guest_get_timezone(&mut self) -> Result<Value> {
        self.call_simple("guest-get-timezone", ReplyShape::Mapping).await
    }

    pub async fn guest_info(&mut self) -> Result<Value> {
        self.call_simple("guest-info", ReplyShape::Mapping).await
    }

    pub async fn guest_get_disks(&mut self) -> Result<Value> {
        self.call_simple("guest-get-disks", ReplyShape::List).await
    }

    pub async fn guest_get_fsinfo(&mut self) -> Result<Value> {
        self.call_simple("guest-get-fsinfo", ReplyShape::List).await
    }

    pub async fn guest_get_users(&mut self) -> Result<Value> {
        self.call_simple("guest-get-users", ReplyShape::List).await
    }

    pub async fn guest_network_get_interfaces(&mut self) -> Result<Value> {
        self.call_simple("guest-network-get-interfaces", ReplyShape::List)
            .await
    }

    pub async fn guest_get_vcpus(&mut self) -> Result<Value> {
        self.call_simple("guest-get-vcpus", ReplyShape::List).await
    }

    pub async fn guest_get_devices(&mut self) -> Result<Value> {
        self.call_simple("guest-get-devices", ReplyShape::List).await
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// Guest wall-clock time (nanoseconds since the epoch on the wire).
    pub async fn guest_get_time(&mut self) -> Result<DateTime<Utc>> {
        let reply = self
            .call_simple("guest-get-time", ReplyShape::Integer)
            .await?;
        let nanos = reply
            .as_i64()
            .ok_or_else(|| ProtocolError::InvalidReply(format!("time out of range: {reply}")))?;
        Ok(DateTime::from_timestamp_nanos(nanos))
    }

    pub async fn guest_set_time(&mut self, time: DateTime<Utc>) -> Result<()> {
        let nanos = time.timestamp_nanos_opt().ok_or_else(|| {
            VmError::config("time", format!("{time} can't be expressed in nanoseconds"))
        })?;
        self.call_with("guest-set-time", json!({ "time": nanos }), ReplyShape::Mapping)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Set `username`'s password; `password` is plaintext and sent base64-encoded.
    pub async fn guest_set_user_password(
        &mut self,
        username: &str,
        password: &str,
        crypted: bool,
    ) -> Result<()> {
        Self::require_user(username)?;
        self.call_with(
            "guest-set-user-password",
            json!({
                "username": username,
                "password": STANDARD.encode(password),
                "crypted": crypted,
            }),
            ReplyShape::Mapping,
        )
        .await?;
        Ok(())
    }

    pub async fn guest_ssh_add_authorized_keys(
        &mut self,
        username: &str,
        keys: &[String],
        reset: bool,
    ) -> Result<()> {
        Self::require_user(username)?;
        self.call_with(
            "guest-ssh-add-authorized-keys",
            json!({ "username": username, "keys": keys, "reset": reset }),
            ReplyShape::Mapping,
        )
        .await?;
        Ok(())
    }

    pub async fn guest_ssh_remove_authorized_keys(
        &mut self,
        username: &str,
        keys: &[String],
    ) -> Result<()> {
        Self::require_user(username)?;
        self.call_with(
            "guest-ssh-remove-authorized-keys",
            json!({ "username": username, "keys": keys }),
            ReplyShape::Mapping,
        )
        .await?;
        Ok(())
    }

    pub async fn guest_ssh_get_authorized_keys(&mut self, username: &str) -> Result<Value> {
        Self::require_user(username)?;
        self.call_with(
            "guest-ssh-get-authorized-keys",
            json!({ "username": username }),
            ReplyShape::Mapping,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Ask the guest to shut down. The agent normally closes the channel
    /// without answering, so a missing reply counts as success.
    pub async fn guest_shutdown(&mut self, mode: Option<ShutdownMode>) -> Result<()> {
        let request = match mode {
            Some(mode) => {
                let mut arguments = Map::new();
                arguments.insert("mode".into(), mode.as_str().into());
                AgentRequest::with_arguments("guest-shutdown", arguments)
            }
            None => AgentRequest::new("guest-shutdown"),
        };
        match self.call(request, ReplyShape::Empty).await {
            Ok(_) | Err(VmError::Protocol(ProtocolError::Disconnected)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `true` only if the agent answered with a mapping; every failure maps
    /// to `false`.
    pub async fn guest_ping(&mut self) -> bool {
        match self.call_simple("guest-ping", ReplyShape::Mapping).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "guest ping failed");
                false
            }
        }
    }
}
