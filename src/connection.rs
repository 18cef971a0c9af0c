//! Connection
//!
//! One authenticated session to one node, plus the local forwards riding on
//! it. Every operation holds the connection's op lock for its full duration,
//! so operations on one node are totally ordered while different nodes run
//! in parallel.
//!
//! Forwarded traffic does not take the op lock. Channel opens for accepted
//! sockets go straight to the session, whose handle owner serializes them.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::forwarding::local::{start_local_forward, ForwardInfo, LocalForward, LocalForwardHandle};
use crate::node::NodeIdentity;
use crate::output::OutputSink;
use crate::response::Response;
use crate::sftp::path_utils::{join_remote_path, relative_remote_path, remote_base_name};
use crate::sftp::TransferFilter;
use crate::ssh::{ExecEvent, RemoteSession, SshError};

/// Shown instead of the command text for sensitive executions
pub const REDACTED: &str = "[redacted]";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct Connection {
    identity: NodeIdentity,
    session: Arc<dyn RemoteSession>,
    sink: Arc<dyn OutputSink>,
    forward_bind_address: String,
    forward_idle_timeout: Duration,
    /// Op lock; also owns the active forwards keyed by bound local port
    forwards: Mutex<HashMap<u16, LocalForwardHandle>>,
    closed: AtomicBool,
    /// Set by the disconnect watcher when the transport goes away
    transport_lost: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(
        identity: NodeIdentity,
        session: Arc<dyn RemoteSession>,
        sink: Arc<dyn OutputSink>,
        config: &RemoteConfig,
    ) -> Self {
        let transport_lost = Arc::new(AtomicBool::new(false));
        if let Some(mut disconnect_rx) = session.subscribe_disconnect() {
            let transport_lost = transport_lost.clone();
            let node = identity.alias.clone();
            tokio::spawn(async move {
                // Closed or lagged both mean the owner task is gone
                let _ = disconnect_rx.recv().await;
                transport_lost.store(true, Ordering::SeqCst);
                info!("Transport to {} lost", node);
            });
        }

        Self {
            identity,
            session,
            sink,
            forward_bind_address: config.forward_bind_address.clone(),
            forward_idle_timeout: config.forward_idle_timeout(),
            forwards: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            transport_lost,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// True once closed, or once the session reported a disconnect
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.transport_lost.load(Ordering::SeqCst)
    }

    /// Take the op lock, refusing if the connection has been closed
    async fn acquire(&self) -> Result<MutexGuard<'_, HashMap<u16, LocalForwardHandle>>> {
        let guard = self.forwards.lock().await;
        if self.is_closed() {
            return Err(RemoteError::Closed {
                node: self.identity.alias.clone(),
            });
        }
        Ok(guard)
    }

    fn session_error(&self, err: SshError) -> RemoteError {
        RemoteError::Session {
            node: self.identity.alias.clone(),
            reason: err.to_string(),
        }
    }

    fn transfer_error(&self, operation: String, reason: impl ToString) -> RemoteError {
        RemoteError::Transfer {
            node: self.identity.alias.clone(),
            operation,
            reason: reason.to_string(),
        }
    }

    /// Run `command` and collect its output
    ///
    /// With `capture_output`, stdout chunks are also streamed to the sink as
    /// they arrive. With `sensitive`, the command text never reaches the sink
    /// or the logs. A non-zero exit status is reported in the response, not
    /// as an error.
    pub async fn execute(
        &self,
        command: &str,
        capture_output: bool,
        sensitive: bool,
    ) -> Result<Response> {
        let _guard = self.acquire().await?;

        let shown = if sensitive { REDACTED } else { command };
        self.sink
            .message(&format!("Executing on {}: {}", self.identity, shown));
        debug!("exec on {}: {}", self.identity, shown);

        let mut events = self
            .session
            .exec(command)
            .await
            .map_err(|e| self.session_error(e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(event) = events.recv().await {
            match event {
                ExecEvent::Stdout(data) => {
                    if capture_output {
                        self.sink.stream(&String::from_utf8_lossy(&data));
                    }
                    stdout.extend_from_slice(&data);
                }
                ExecEvent::Stderr(data) => stderr.extend_from_slice(&data),
                ExecEvent::ExitStatus(status) => exit_status = Some(status),
            }
        }

        debug!(
            "exec on {} finished with status {:?} ({} bytes stdout, {} bytes stderr)",
            self.identity,
            exit_status,
            stdout.len(),
            stderr.len()
        );

        Ok(Response {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    /// Copy one local file to an exact remote path, overwriting it
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let _guard = self.acquire().await?;
        self.upload_file_unlocked(local, remote).await
    }

    /// Mirror `local_dir` into `remote_dir`, depth-first and sequentially
    pub async fn upload_directory(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let _guard = self.acquire().await?;
        self.sink.message(&format!(
            "Uploading directory {} to {}:{}",
            local_dir.display(),
            self.identity,
            remote_dir
        ));
        self.upload_directory_unlocked(local_dir, remote_dir).await
    }

    async fn upload_file_unlocked(&self, local: &Path, remote: &str) -> Result<()> {
        self.sink.message(&format!(
            "Uploading {} to {}:{}",
            local.display(),
            self.identity,
            remote
        ));
        let bytes = self
            .session
            .upload_file(local, remote)
            .await
            .map_err(|e| self.transfer_error(format!("upload {}", local.display()), e))?;
        debug!("Uploaded {} bytes to {}:{}", bytes, self.identity, remote);
        Ok(())
    }

    fn upload_directory_unlocked<'a>(
        &'a self,
        local_dir: &'a Path,
        remote_dir: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let operation = || format!("upload {}", local_dir.display());

            self.session
                .create_dir_all(remote_dir)
                .await
                .map_err(|e| self.transfer_error(operation(), e))?;

            let mut read_dir = tokio::fs::read_dir(local_dir)
                .await
                .map_err(|e| self.transfer_error(operation(), e))?;

            let mut entries = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| self.transfer_error(operation(), e))?
            {
                entries.push(entry);
            }
            entries.sort_by_key(|entry| entry.file_name());

            for entry in entries {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| self.transfer_error(operation(), e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let remote = join_remote_path(remote_dir, &name);
                let path = entry.path();

                if file_type.is_dir() {
                    self.upload_directory_unlocked(&path, &remote).await?;
                } else if file_type.is_file() {
                    self.upload_file_unlocked(&path, &remote).await?;
                } else {
                    debug!("Skipping {} (not a file or directory)", path.display());
                }
            }
            Ok(())
        })
    }

    /// Copy one remote file to an exact local path, creating local parents
    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        let _guard = self.acquire().await?;
        self.download_file_unlocked(remote, local).await
    }

    async fn download_file_unlocked(&self, remote: &str, local: &Path) -> Result<()> {
        self.sink.message(&format!(
            "Downloading {}:{} to {}",
            self.identity,
            remote,
            local.display()
        ));
        let bytes = self
            .session
            .download_file(remote, local)
            .await
            .map_err(|e| self.transfer_error(format!("download {}", remote), e))?;
        debug!("Downloaded {} bytes from {}:{}", bytes, self.identity, remote);
        Ok(())
    }

    /// Download every regular file below `remote_dir` that passes the filter
    ///
    /// Excludes win over includes; both match the base name. An empty include
    /// list keeps everything not excluded. Returns the downloaded paths
    /// relative to `remote_dir`.
    pub async fn download_directory(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<String>> {
        let _guard = self.acquire().await?;
        let filter = TransferFilter::new(include, exclude);

        self.sink.message(&format!(
            "Downloading directory {}:{} to {}",
            self.identity,
            remote_dir,
            local_dir.display()
        ));

        let files = self
            .session
            .list_files(remote_dir)
            .await
            .map_err(|e| self.transfer_error(format!("list {}", remote_dir), e))?;

        let mut downloaded = Vec::new();
        for file in files {
            let relative = relative_remote_path(remote_dir, &file)
                .unwrap_or_else(|| remote_base_name(&file))
                .to_string();
            if !filter.accepts(&relative) {
                debug!("Filtered out {}:{}", self.identity, file);
                continue;
            }

            let local = local_path_for(local_dir, &relative);
            self.download_file_unlocked(&file, &local).await?;
            downloaded.push(relative);
        }

        info!(
            "Downloaded {} files from {}:{}",
            downloaded.len(),
            self.identity,
            remote_dir
        );
        Ok(downloaded)
    }

    /// Bind a local listener bridged to `remote_host:remote_port` on the node
    ///
    /// `local_port` 0 asks the OS for a port. Returns the bound port.
    pub async fn create_local_port_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16> {
        let (bound, _running) = self
            .start_forward(local_port, remote_host, remote_port)
            .await?;
        Ok(bound)
    }

    /// Like `create_local_port_forward`, also returning the forward's running flag
    pub(crate) async fn start_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(u16, Arc<AtomicBool>)> {
        let mut forwards = self.acquire().await?;

        self.sink.message(&format!(
            "Forwarding local port {} to {}:{} on {}",
            local_port, remote_host, remote_port, self.identity
        ));

        let config = LocalForward::new(local_port, remote_host, remote_port)
            .with_bind_address(self.forward_bind_address.clone())
            .with_idle_timeout(self.forward_idle_timeout);

        let handle = start_local_forward(self.session.clone(), config)
            .await
            .map_err(|e| RemoteError::TunnelBind {
                node: self.identity.alias.clone(),
                local_port,
                reason: e.to_string(),
            })?;

        let bound = handle.local_port();
        let running = handle.running_flag();
        forwards.insert(bound, handle);
        Ok((bound, running))
    }

    /// Stop the forward bound on `local_port`; unknown ports are ignored
    pub async fn close_local_port_forward(&self, local_port: u16) {
        let mut forwards = self.forwards.lock().await;
        match forwards.remove(&local_port) {
            Some(handle) => {
                handle.stop().await;
                debug!("Closed local forward {} on {}", local_port, self.identity);
            }
            None => debug!("No local forward {} on {}", local_port, self.identity),
        }
    }

    /// Snapshot of the active forwards
    pub async fn forwards(&self) -> Vec<ForwardInfo> {
        let forwards = self.forwards.lock().await;
        let mut infos: Vec<ForwardInfo> = forwards.values().map(|h| h.info()).collect();
        infos.sort_by_key(|info| info.local_port);
        infos
    }

    /// Keepalive check; false once closed
    pub async fn is_alive(&self) -> bool {
        match self.acquire().await {
            Ok(_guard) => self.session.ping().await,
            Err(_) => false,
        }
    }

    /// Stop every forward, then close the session. Later calls do nothing.
    pub async fn close(&self) {
        let mut forwards = self.forwards.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for (port, handle) in forwards.drain() {
            handle.stop().await;
            if handle.is_running() {
                warn!("Local forward {} on {} did not stop", port, self.identity);
            }
        }

        self.session.close().await;
        info!("Connection to {} closed", self.identity);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Local destination for a remote path relative to the download root
fn local_path_for(local_dir: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(local_dir.to_path_buf(), |path, segment| path.join(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node, wait_until, FakeSession, RecordingSink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn connection(alias: &str) -> (Connection, Arc<FakeSession>, Arc<RecordingSink>) {
        let fake = Arc::new(FakeSession::new(alias));
        let sink = Arc::new(RecordingSink::default());
        let config = RemoteConfig {
            forward_bind_address: "127.0.0.1".to_string(),
            ..RemoteConfig::default()
        };
        let conn = Connection::new(node(alias), fake.clone(), sink.clone(), &config);
        (conn, fake, sink)
    }

    #[tokio::test]
    async fn test_execute_collects_separate_streams() {
        let (conn, fake, sink) = connection("db0");
        fake.script(
            "nodetool status",
            Response::new("UN 10.0.0.1\n", "warning\n").with_exit_status(3),
        );

        let response = conn.execute("nodetool status", true, false).await.unwrap();
        assert_eq!(response.stdout, "UN 10.0.0.1\n");
        assert_eq!(response.stderr, "warning\n");
        assert_eq!(response.exit_status, Some(3));
        assert!(!response.success());

        assert_eq!(sink.streams().concat(), "UN 10.0.0.1\n");
        assert!(sink.messages()[0].contains("nodetool status"));
    }

    #[tokio::test]
    async fn test_execute_without_capture_does_not_stream() {
        let (conn, fake, sink) = connection("db0");
        fake.script("uptime", Response::new("up 3 days", "").with_exit_status(0));

        let response = conn.execute("uptime", false, false).await.unwrap();
        assert_eq!(response.stdout, "up 3 days");
        assert!(sink.streams().is_empty());
    }

    #[tokio::test]
    async fn test_sensitive_command_is_redacted() {
        let (conn, fake, sink) = connection("db0");

        conn.execute("echo hunter2 | chpasswd", false, true)
            .await
            .unwrap();
        assert!(sink.messages().iter().all(|m| !m.contains("hunter2")));
        assert!(sink.messages().iter().any(|m| m.contains(REDACTED)));
        // The real command still runs
        assert_eq!(fake.executed(), vec!["echo hunter2 | chpasswd".to_string()]);

        conn.execute("echo visible", false, false).await.unwrap();
        assert!(sink.messages().iter().any(|m| m.contains("echo visible")));
    }

    #[tokio::test]
    async fn test_operations_are_serialized() {
        let (conn, fake, _sink) = connection("db0");
        fake.set_op_delay(Duration::from_millis(20));
        let conn = Arc::new(conn);

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.execute(&format!("cmd {}", i), false, false).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fake.executed().len(), 5);
        assert_eq!(fake.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_upload_directory_mirrors_tree() {
        let (conn, fake, _sink) = connection("db0");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cassandra.yaml"), b"cluster_name: lab").unwrap();
        std::fs::create_dir_all(dir.path().join("conf/extra")).unwrap();
        std::fs::write(dir.path().join("conf/jvm.options"), b"-Xmx4G").unwrap();
        std::fs::write(dir.path().join("conf/extra/env.sh"), b"export A=1").unwrap();

        conn.upload_directory(dir.path(), "/home/ubuntu/cassandra")
            .await
            .unwrap();

        assert_eq!(
            fake.file_paths(),
            vec![
                "/home/ubuntu/cassandra/cassandra.yaml".to_string(),
                "/home/ubuntu/cassandra/conf/extra/env.sh".to_string(),
                "/home/ubuntu/cassandra/conf/jvm.options".to_string(),
            ]
        );
        assert_eq!(
            fake.file("/home/ubuntu/cassandra/conf/jvm.options").unwrap(),
            b"-Xmx4G"
        );
        assert!(fake.has_dir("/home/ubuntu/cassandra/conf/extra"));
    }

    #[tokio::test]
    async fn test_upload_missing_file_is_transfer_error() {
        let (conn, _fake, _sink) = connection("db0");
        let dir = tempfile::tempdir().unwrap();

        let err = conn
            .upload_file(&dir.path().join("missing.txt"), "/tmp/missing.txt")
            .await
            .unwrap_err();
        match err {
            RemoteError::Transfer { node, operation, .. } => {
                assert_eq!(node, "db0");
                assert!(operation.contains("missing.txt"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_file_creates_local_parents() {
        let (conn, fake, _sink) = connection("db0");
        fake.put_file("/etc/hosts", b"127.0.0.1 localhost");
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/hosts");

        conn.download_file("/etc/hosts", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"127.0.0.1 localhost");
    }

    #[tokio::test]
    async fn test_download_directory_filters_on_base_name() {
        let (conn, fake, _sink) = connection("db0");
        fake.put_file("/var/log/cassandra/a.log", b"a");
        fake.put_file("/var/log/cassandra/b.txt", b"b");
        fake.put_file("/var/log/cassandra/sub/c.log", b"c");
        fake.put_file("/var/log/cassandra/sub/d.log", b"d");
        let dir = tempfile::tempdir().unwrap();

        let downloaded = conn
            .download_directory(
                "/var/log/cassandra",
                dir.path(),
                &["*.log".to_string()],
                &["c.*".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(downloaded, vec!["a.log".to_string(), "sub/d.log".to_string()]);
        assert!(dir.path().join("a.log").exists());
        assert!(dir.path().join("sub/d.log").exists());
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join("sub/c.log").exists());

        // Include alone keeps every matching base name, at any depth
        let logs_only = tempfile::tempdir().unwrap();
        let downloaded = conn
            .download_directory(
                "/var/log/cassandra",
                logs_only.path(),
                &["*.log".to_string()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(
            downloaded,
            vec![
                "a.log".to_string(),
                "sub/c.log".to_string(),
                "sub/d.log".to_string()
            ]
        );
        assert!(logs_only.path().join("sub/c.log").exists());
        assert!(!logs_only.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_download_directory_without_include_keeps_everything() {
        let (conn, fake, _sink) = connection("db0");
        fake.put_file("/data/x.db", b"x");
        fake.put_file("/data/y.tmp", b"y");
        let dir = tempfile::tempdir().unwrap();

        let downloaded = conn
            .download_directory("/data", dir.path(), &[], &["*.tmp".to_string()])
            .await
            .unwrap();
        assert_eq!(downloaded, vec!["x.db".to_string()]);
    }

    #[tokio::test]
    async fn test_local_forward_explicit_port_and_close() {
        let (conn, fake, _sink) = connection("db0");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let wanted = listener.local_addr().unwrap().port();
        drop(listener);

        let port = conn
            .create_local_port_forward(wanted, "localhost", 9042)
            .await
            .unwrap();
        assert_eq!(port, wanted);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"cql").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cql");
        assert_eq!(fake.direct_tcpip_targets(), vec![("localhost".to_string(), 9042)]);
        drop(client);

        assert_eq!(conn.forwards().await.len(), 1);
        conn.close_local_port_forward(port).await;
        assert!(conn.forwards().await.is_empty());
        // Unknown port is a no-op
        conn.close_local_port_forward(port).await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_tunnel_bind_error() {
        let (conn, _fake, _sink) = connection("db0");
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let err = conn
            .create_local_port_forward(port, "localhost", 9042)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteError::TunnelBind { local_port, .. } if local_port == port
        ));
        assert!(conn.forwards().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_forwards() {
        let (conn, fake, _sink) = connection("db0");
        let port = conn
            .create_local_port_forward(0, "localhost", 8080)
            .await
            .unwrap();

        assert!(conn.is_alive().await);
        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(!conn.is_alive().await);
        assert_eq!(fake.close_count(), 1);
        assert!(conn.forwards().await.is_empty());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        let err = conn.execute("uptime", false, false).await.unwrap_err();
        assert!(matches!(err, RemoteError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_transport_loss_marks_connection_closed() {
        let (conn, fake, _sink) = connection("db0");
        let port = conn
            .create_local_port_forward(0, "localhost", 8080)
            .await
            .unwrap();
        assert!(!conn.is_closed());

        fake.drop_transport();
        assert!(wait_until(|| conn.is_closed()).await);

        let err = conn.execute("uptime", false, false).await.unwrap_err();
        assert!(matches!(err, RemoteError::Closed { .. }));

        // Explicit close still releases forwards after the transport died
        conn.close().await;
        assert!(conn.forwards().await.is_empty());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
