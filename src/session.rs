//! The device-level aggregate: one listener, at most one live peer
//! connection, one transfer engine, and the event stream the embedding
//! application consumes.
//!
//! Socket reads run in a per-connection reader task that feeds the
//! framer and dispatches decoded messages through the engine; all writes
//! funnel through a single writer task so concurrent senders can never
//! interleave bytes mid-message.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{self, Advertiser};
use crate::engine::{Action, TransferDescriptor, TransferEngine};
use crate::framer::MessageFramer;
use crate::protocol::{self, timeouts, FileMeta, Message, CHUNK_SIZE, DEFAULT_PORT};
use crate::transport::{self, PeerStream};
use crate::url::PeerDescriptor;

/// Rough classification carried on [`Event::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Conflict,
    Io,
    Timeout,
}

/// Everything the embedding application can observe.
#[derive(Debug, Clone)]
pub enum Event {
    Connected { peer: String },
    FileOffered(TransferDescriptor),
    Progress { sent_bytes: u64, received_bytes: u64 },
    TransferComplete {
        descriptor: TransferDescriptor,
        path: Option<PathBuf>,
    },
    Disconnected,
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name shown to peers in beacons and the connect handshake.
    pub device_name: String,
    /// Directory received files are written into.
    pub save_dir: PathBuf,
    /// TCP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Try TLS before plain TCP, in both roles.
    pub prefer_secure: bool,
    pub chunk_size: usize,
    /// Externally provisioned certificate, instead of the generated one.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let device_name = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flick-device".to_string());
        Self {
            device_name,
            save_dir: PathBuf::from("received"),
            port: DEFAULT_PORT,
            prefer_secure: true,
            chunk_size: CHUNK_SIZE,
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// Which side of the socket this device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

struct Connection {
    peer_name: Option<String>,
    secured: bool,
    role: Role,
    writer: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    engine: Mutex<TransferEngine>,
    conn: Mutex<Option<Connection>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    /// Address the listener actually bound, once it is up.
    listen_addr: Mutex<Option<SocketAddr>>,
    events: mpsc::UnboundedSender<Event>,
}

/// Handle to one device's transfer session. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            engine: Mutex::new(TransferEngine::with_chunk_size(config.chunk_size)),
            conn: Mutex::new(None),
            listener_task: Mutex::new(None),
            listen_addr: Mutex::new(None),
            config,
            events,
        });
        (Self { inner }, rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Bind the transfer listener and start accepting in the background.
    /// Returns the bound address so callers using port 0 learn the port.
    pub async fn start_listening(&self) -> Result<SocketAddr> {
        let cfg = &self.inner.config;
        let listener = transport::Listener::bind(
            cfg.port,
            cfg.prefer_secure,
            cfg.tls_cert.clone(),
            cfg.tls_key.clone(),
        )
        .await?;
        let addr = listener.local_addr().context("listener local addr")?;
        info!(%addr, secure = listener.is_secure(), "listening for peers");
        *self.inner.listen_addr.lock() = Some(addr);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        // attach claims the connection slot atomically;
                        // a loser here just has its stream dropped.
                        if inner.attach(stream, Role::Acceptor, None) {
                            info!(%peer, "peer connected");
                        } else {
                            warn!(%peer, "already connected, dropping incoming connection");
                        }
                    }
                    Err(e) => {
                        // Usually a failed TLS handshake; keep serving.
                        warn!(error = %e, "incoming connection failed");
                    }
                }
            }
        });
        if let Some(old) = self.inner.listener_task.lock().replace(handle) {
            old.abort();
        }
        Ok(addr)
    }

    /// Connect out to a peer, racing the whole attempt (TLS handshake and
    /// plain retry included) against the connect timeout.
    pub async fn connect(&self, host: &str, port: u16, peer_name: &str) -> Result<()> {
        if self.inner.conn.lock().is_some() {
            self.inner.emit(Event::Error {
                kind: ErrorKind::Conflict,
                message: "already connected to a peer".into(),
            });
            bail!("already connected to a peer");
        }
        let prefer = self.inner.config.prefer_secure;
        let stream = match tokio::time::timeout(
            timeouts::CONNECT,
            transport::connect(host, port, prefer),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.inner.emit(Event::Error {
                    kind: ErrorKind::Transport,
                    message: format!("could not reach {host}:{port}: {e:#}"),
                });
                return Err(e);
            }
            Err(_) => {
                self.inner.emit(Event::Error {
                    kind: ErrorKind::Timeout,
                    message: format!("connection attempt to {host}:{port} timed out"),
                });
                bail!("connection attempt to {host}:{port} timed out");
            }
        };
        // The slot may have been claimed by an inbound peer while the
        // dial was in flight; the earlier check cannot cover that await.
        if !self
            .inner
            .attach(stream, Role::Initiator, Some(peer_name.to_string()))
        {
            self.inner.emit(Event::Error {
                kind: ErrorKind::Conflict,
                message: format!("a peer connected while dialing {host}:{port}"),
            });
            bail!("a peer connected while dialing {host}:{port}");
        }
        info!(host, port, secured = self.is_secured(), "connected to peer");
        self.inner.send(Message::Connect {
            device_name: self.inner.config.device_name.clone(),
        });
        Ok(())
    }

    /// Connect using a descriptor string, as shared manually or heard in
    /// a discovery beacon.
    pub async fn connect_descriptor(&self, descriptor: &str) -> Result<()> {
        let d = PeerDescriptor::parse(descriptor)?;
        self.connect(&d.host, d.port, &d.name).await
    }

    /// Drop the peer connection. In-flight transfer state is discarded;
    /// the listener, if any, keeps running.
    pub fn disconnect(&self) {
        let conn = self.inner.conn.lock().take();
        if let Some(c) = conn {
            c.reader_task.abort();
            c.writer_task.abort();
            self.inner.engine.lock().reset();
            self.inner.emit(Event::Disconnected);
        }
    }

    /// Stop listening and disconnect.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.listener_task.lock().take() {
            task.abort();
        }
        *self.inner.listen_addr.lock() = None;
        self.disconnect();
    }

    /// Offer a file to the connected peer. Returns once the offer is
    /// queued; progress and completion arrive as events.
    pub async fn offer_file(&self, path: &Path) -> Result<()> {
        if self.inner.conn.lock().is_none() {
            self.inner.emit(Event::Error {
                kind: ErrorKind::Transport,
                message: "no peer connected".into(),
            });
            bail!("no peer connected");
        }
        let data = match tokio::fs::read(path).await {
            Ok(d) => d,
            Err(e) => {
                self.inner.emit(Event::Error {
                    kind: ErrorKind::Io,
                    message: format!("could not read {}: {e}", path.display()),
                });
                return Err(e).with_context(|| format!("read {}", path.display()));
            }
        };
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mime = protocol::mime_for(&name);

        let offer = {
            let mut engine = self.inner.engine.lock();
            engine.offer(&name, mime, Some(path.to_path_buf()), &data)
        };
        match offer {
            Ok(msg) => {
                info!(name = %name, size = data.len(), "offering file");
                self.inner.send(msg);
                Ok(())
            }
            Err(e) => {
                self.inner.emit(Event::Error {
                    kind: ErrorKind::Conflict,
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// This device's shareable connection descriptor. Uses the port the
    /// listener actually bound, so a port-0 config advertises the
    /// ephemeral port and not the unconnectable zero.
    pub fn descriptor(&self) -> PeerDescriptor {
        let host = discovery::local_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = self
            .inner
            .listen_addr
            .lock()
            .map(|a| a.port())
            .unwrap_or(self.inner.config.port);
        PeerDescriptor {
            host,
            port,
            name: self.inner.config.device_name.clone(),
        }
    }

    /// Start beaconing this device's descriptor to the LAN.
    pub fn announce(&self) -> Advertiser {
        Advertiser::start(self.descriptor().to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    pub fn is_secured(&self) -> bool {
        self.inner.conn.lock().as_ref().map_or(false, |c| c.secured)
    }

    pub fn peer_name(&self) -> Option<String> {
        self.inner.conn.lock().as_ref().and_then(|c| c.peer_name.clone())
    }

    /// Which side of the current connection this device is on.
    pub fn role(&self) -> Option<Role> {
        self.inner.conn.lock().as_ref().map(|c| c.role)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.inner.engine.lock().sent_bytes()
    }

    pub fn received_bytes(&self) -> u64 {
        self.inner.engine.lock().received_bytes()
    }

    pub fn sent_files(&self) -> Vec<TransferDescriptor> {
        self.inner.engine.lock().sent_files()
    }

    pub fn received_files(&self) -> Vec<TransferDescriptor> {
        self.inner.engine.lock().received_files()
    }
}

impl Inner {
    /// Wire a fresh stream into reader and writer tasks and install it as
    /// the session's connection. Returns false, dropping the stream, when
    /// a connection already holds the slot. The slot lock is held across
    /// the task spawns so the reader can never observe an empty slot and
    /// a racing attach can never overwrite a live connection.
    fn attach(self: &Arc<Self>, stream: PeerStream, role: Role, peer_name: Option<String>) -> bool {
        let mut slot = self.conn.lock();
        if slot.is_some() {
            return false;
        }
        let secured = stream.is_secure();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_loop(write_half, rx));
        let reader_inner = self.clone();
        let reader_task = tokio::spawn(reader_inner.read_loop(read_half));

        debug!(?role, secured, "connection attached");
        *slot = Some(Connection {
            peer_name: peer_name.clone(),
            secured,
            role,
            writer: tx,
            reader_task,
            writer_task,
        });
        drop(slot);
        // The acceptor learns the name from the connect message instead.
        if let Some(name) = peer_name {
            self.emit(Event::Connected { peer: name });
        }
        true
    }

    async fn read_loop(self: Arc<Self>, mut half: ReadHalf<PeerStream>) {
        let mut framer = MessageFramer::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match half.read(&mut buf).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(n) => {
                    for msg in framer.feed(&buf[..n]) {
                        self.dispatch(msg).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "socket read failed");
                    break;
                }
            }
        }
        self.teardown();
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        if let Message::Connect { device_name } = &msg {
            if let Some(c) = self.conn.lock().as_mut() {
                c.peer_name = Some(device_name.clone());
            }
        }
        let actions = self.engine.lock().handle_message(msg);
        for action in actions {
            match action {
                Action::Send(msg) => self.send(msg),
                Action::SaveFile { meta, bytes } => self.save_file(meta, bytes).await,
                Action::Notify(event) => self.emit(event),
            }
        }
    }

    fn send(&self, msg: Message) {
        match self.conn.lock().as_ref() {
            Some(c) => {
                let _ = c.writer.send(msg);
            }
            None => warn!("dropping outbound message, no connection"),
        }
    }

    async fn save_file(&self, meta: FileMeta, bytes: Vec<u8>) {
        let result = async {
            tokio::fs::create_dir_all(&self.config.save_dir).await?;
            let path = unique_path(&self.config.save_dir, &sanitize_name(&meta.name));
            tokio::fs::write(&path, &bytes).await?;
            Ok::<PathBuf, std::io::Error>(path)
        }
        .await;
        match result {
            Ok(path) => {
                info!(name = %meta.name, path = %path.display(), "file received");
                let descriptor = self.engine.lock().mark_saved(meta.id, path.clone());
                if let Some(descriptor) = descriptor {
                    self.emit(Event::TransferComplete {
                        descriptor,
                        path: Some(path),
                    });
                }
            }
            Err(e) => {
                warn!(name = %meta.name, error = %e, "failed to save received file");
                self.emit(Event::Error {
                    kind: ErrorKind::Io,
                    message: format!("failed to save {:?}: {e}", meta.name),
                });
            }
        }
    }

    /// Reader-side teardown after EOF or a read error. The user-initiated
    /// path is [`Session::disconnect`]; whichever runs first wins.
    fn teardown(&self) {
        let conn = self.conn.lock().take();
        if let Some(c) = conn {
            c.writer_task.abort();
            self.engine.lock().reset();
            self.emit(Event::Disconnected);
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

async fn write_loop(
    mut half: WriteHalf<PeerStream>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if msg.is_chunk_traffic() {
            tokio::time::sleep(timeouts::CHUNK_PACING).await;
        }
        let text = match protocol::encode(&msg) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = half.write_all(text.as_bytes()).await {
            warn!(error = %e, "socket write failed");
            break;
        }
    }
    let _ = half.shutdown().await;
}

/// Keep only the final path component so a peer-supplied name can never
/// escape the save directory.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "received.bin".to_string())
}

/// First non-colliding path in `dir`, appending ` (n)` before the
/// extension the way desktop file managers do.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), Some(e.to_string())),
        _ => (name.to_string(), None),
    };
    for i in 1..10_000u32 {
        let attempt = match &ext {
            Some(e) => format!("{stem} ({i}).{e}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = dir.join(attempt);
        if !candidate.exists() {
            return candidate;
        }
    }
    dir.join(format!("{}-{}", Uuid::new_v4(), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directory_components() {
        assert_eq!(sanitize_name("photo.png"), "photo.png");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("/abs/path/file.txt"), "file.txt");
        assert_eq!(sanitize_name(".."), "received.bin");
        assert_eq!(sanitize_name(""), "received.bin");
    }

    #[test]
    fn unique_path_numbers_collisions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        let p = unique_path(dir.path(), "a.txt");
        assert_eq!(p, dir.path().join("a (2).txt"));

        let fresh = unique_path(dir.path(), "b.txt");
        assert_eq!(fresh, dir.path().join("b.txt"));
    }

    #[test]
    fn unique_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "README"), dir.path().join("README (1)"));
    }

    #[test]
    fn default_config_is_usable() {
        let cfg = SessionConfig::default();
        assert!(!cfg.device_name.is_empty());
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.prefer_secure);
        assert_eq!(cfg.chunk_size, CHUNK_SIZE);
    }
}
