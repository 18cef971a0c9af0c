//! In-memory test doubles for sessions, connectors and output sinks

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::error::Error as StdError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use crate::connection_manager::Connector;
use crate::error::RemoteError;
use crate::node::NodeIdentity;
use crate::response::Response;
use crate::sftp::path_utils::remote_dir_chain;
use crate::sftp::SftpError;
use crate::ssh::{BoxedTunnelStream, ExecEvent, RemoteSession, SshError};

pub fn node(alias: &str) -> NodeIdentity {
    NodeIdentity::new(
        format!("203.0.113.{}", alias.len()),
        format!("10.0.0.{}", alias.len()),
        alias,
        "us-west-2a",
    )
}

/// Poll `condition` until it holds, giving up after one second
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Session with an in-memory remote filesystem and echoing tunnels
pub struct FakeSession {
    alias: String,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    scripted: Mutex<HashMap<String, Response>>,
    executed: Mutex<Vec<String>>,
    direct_tcpip: Mutex<Vec<(String, u16)>>,
    op_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_direct_tcpip: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
    disconnect_tx: broadcast::Sender<()>,
}

impl FakeSession {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            files: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            scripted: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            direct_tcpip: Mutex::new(Vec::new()),
            op_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_direct_tcpip: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            disconnect_tx: broadcast::channel(1).0,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.dirs.lock().extend(remote_dir_chain(parent));
        }
        self.files.lock().insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().contains(path)
    }

    pub fn script(&self, command: &str, response: Response) {
        self.scripted.lock().insert(command.to_string(), response);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn direct_tcpip_targets(&self) -> Vec<(String, u16)> {
        self.direct_tcpip.lock().clone()
    }

    /// Make every exec/transfer take at least `delay`
    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock() = delay;
    }

    /// Highest number of exec/transfer calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_direct_tcpip(&self, fail: bool) {
        self.fail_direct_tcpip.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Simulate the transport dying underneath the session
    pub fn drop_transport(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(());
    }

    async fn track_op(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.op_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<mpsc::Receiver<ExecEvent>, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        self.track_op().await;
        self.executed.lock().push(command.to_string());

        let response = self
            .scripted
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_else(|| Response::default().with_exit_status(0));

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            // Deliver stdout in two chunks to exercise incremental delivery
            let stdout = response.stdout.into_bytes();
            let mid = stdout.len() / 2;
            for chunk in [&stdout[..mid], &stdout[mid..]] {
                if !chunk.is_empty() {
                    let _ = tx.send(ExecEvent::Stdout(chunk.to_vec())).await;
                }
            }
            if !response.stderr.is_empty() {
                let _ = tx.send(ExecEvent::Stderr(response.stderr.into_bytes())).await;
            }
            if let Some(status) = response.exit_status {
                let _ = tx.send(ExecEvent::ExitStatus(status)).await;
            }
        });
        Ok(rx)
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, SftpError> {
        self.track_op().await;
        let content = tokio::fs::read(local_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SftpError::FileNotFound(local_path.display().to_string())
            }
            _ => SftpError::IoError(e),
        })?;
        let len = content.len() as u64;
        self.files.lock().insert(remote_path.to_string(), content);
        Ok(len)
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64, SftpError> {
        self.track_op().await;
        let content = self
            .file(remote_path)
            .ok_or_else(|| SftpError::FileNotFound(remote_path.to_string()))?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &content).await?;
        Ok(content.len() as u64)
    }

    async fn create_dir_all(&self, remote_path: &str) -> Result<(), SftpError> {
        self.dirs.lock().extend(remote_dir_chain(remote_path));
        Ok(())
    }

    async fn list_files(&self, remote_dir: &str) -> Result<Vec<String>, SftpError> {
        self.track_op().await;
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let files: Vec<String> = self
            .files
            .lock()
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        if files.is_empty() && !self.has_dir(remote_dir.trim_end_matches('/')) {
            return Err(SftpError::DirectoryNotFound(remote_dir.to_string()));
        }
        Ok(files)
    }

    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedTunnelStream, SshError> {
        if self.fail_direct_tcpip.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("administratively prohibited".into()));
        }
        self.direct_tcpip.lock().push((host.to_string(), port));

        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if server.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(client))
    }

    async fn ping(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.disconnect_tx.send(());
    }

    fn subscribe_disconnect(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.disconnect_tx.subscribe())
    }
}

/// Connector handing out `FakeSession`s
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    delay: Duration,
    failing: HashSet<String>,
    seed_files: Vec<(String, Vec<u8>)>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow down connects so concurrent callers overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, alias: &str) -> Self {
        self.failing.insert(alias.to_string());
        self
    }

    /// Every new session starts with this remote file
    pub fn with_remote_file(mut self, path: &str, content: &[u8]) -> Self {
        self.seed_files.push((path.to_string(), content.to_vec()));
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn session(&self, alias: &str) -> Option<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.alias() == alias)
            .cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, node: &NodeIdentity) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&node.alias) {
            return Err(RemoteError::Connect {
                node: node.alias.clone(),
                reason: "Connection refused".into(),
            });
        }

        let session = Arc::new(FakeSession::new(&node.alias));
        for (path, content) in &self.seed_files {
            session.put_file(path, content);
        }
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Sink that records every event
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    streams: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn streams(&self) -> Vec<String> {
        self.streams.lock().clone()
    }
}

impl crate::output::OutputSink for RecordingSink {
    fn message(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }

    fn error(&self, text: &str, cause: Option<&(dyn StdError + 'static)>) {
        let entry = match cause {
            Some(cause) => format!("{}: {}", text, cause),
            None => text.to_string(),
        };
        self.errors.lock().push(entry);
    }

    fn stream(&self, chunk: &str) {
        self.streams.lock().push(chunk.to_string());
    }
}
