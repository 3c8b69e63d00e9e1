//! Service side of the control endpoint.
//!
//! Every accepted client gets its own bounded outbound queue drained by a
//! writer task. Inbound frames are forwarded to a single handler channel in
//! per-client wire order.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::wait_for_shutdown;
use crate::protocol::{decode_event, encode_event, Event, DEFAULT_MAX_FRAME_BYTES};
use crate::transport::{Connection, FrameReader, FrameWriter};

pub type ClientId = String;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("control endpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control endpoint {0} is already served by another process")]
    InUse(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(ClientId),
    Received(ClientId, Event),
    Disconnected(ClientId),
}

pub struct ControlServer {
    config: ServerConfig,
    listener: UnixListener,
    hub: Arc<Hub>,
}

/// Cloneable handle for pushing events to connected clients.
#[derive(Clone)]
pub struct ServerHandle {
    hub: Arc<Hub>,
}

struct Hub {
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<ClientId, mpsc::Sender<Arc<[u8]>>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    max_frame_bytes: usize,
}

impl ControlServer {
    /// Binds the endpoint, replacing a stale socket file left by a dead
    /// process. Must be called inside a tokio runtime.
    pub fn bind(
        config: ServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ServerError> {
        let path = config.socket_path.clone();
        let io_err = |source| ServerError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_err)?;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(ServerError::InUse(path.clone()));
            }
            debug!(event = "ctl_remove_stale_socket", socket = %path.display());
            let _ = fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path).map_err(io_err)?;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));

        let (events, events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Hub {
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            events,
            max_frame_bytes: config.max_frame_bytes,
        });
        Ok((
            Self {
                config,
                listener,
                hub,
            },
            events_rx,
        ))
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            hub: self.hub.clone(),
        }
    }

    /// Accepts clients until `shutdown` flips to true, then closes every
    /// connection and removes the socket file.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        info!(event = "ctl_start", socket = %self.config.socket_path.display());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, _addr)) => {
                            connections.spawn(handle_connection(
                                self.hub.clone(),
                                stream,
                                self.config.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(err) => {
                            warn!(event = "ctl_accept_error", error = %err);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        drop(self.listener);
        let _ = fs::remove_file(&self.config.socket_path);
        info!(event = "ctl_stop", socket = %self.config.socket_path.display());
        Ok(())
    }
}

impl ServerHandle {
    /// Queues `event` for every connected client and returns how many
    /// accepted it. Clients that cannot take the frame are dropped.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let frame: Arc<[u8]> = match encode_event(event, self.hub.max_frame_bytes) {
            Ok(frame) => Arc::from(frame),
            Err(err) => {
                warn!(event = "ctl_encode_error", name = %event.name, error = %err);
                return 0;
            }
        };

        let clients = self.hub.clients.read().await.clone();
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (conn_id, sender) in clients {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(conn_id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "ctl_slow_client", conn_id = %conn_id);
                    dropped.push(conn_id);
                }
            }
        }
        for conn_id in dropped {
            self.hub.unregister(&conn_id).await;
        }
        debug!(event = "ctl_broadcast", name = %event.name, delivered = delivered);
        delivered
    }

    pub async fn send_to(&self, conn_id: &str, event: &Event) -> bool {
        let sender = self.hub.clients.read().await.get(conn_id).cloned();
        let Some(sender) = sender else {
            return false;
        };
        let frame = match encode_event(event, self.hub.max_frame_bytes) {
            Ok(frame) => Arc::from(frame),
            Err(err) => {
                warn!(event = "ctl_encode_error", name = %event.name, error = %err);
                return false;
            }
        };
        if sender.try_send(frame).is_err() {
            self.hub.unregister(conn_id).await;
            return false;
        }
        true
    }

    pub async fn client_count(&self) -> usize {
        self.hub.clients.read().await.len()
    }
}

impl Hub {
    fn next_conn_id(&self) -> ClientId {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("ctl-conn-{id}")
    }

    async fn register(&self, conn_id: ClientId, sender: mpsc::Sender<Arc<[u8]>>) {
        self.clients.write().await.insert(conn_id.clone(), sender);
        info!(event = "ctl_client_connected", conn_id = %conn_id);
        let _ = self.events.send(ServerEvent::Connected(conn_id));
    }

    async fn unregister(&self, conn_id: &str) {
        if self.clients.write().await.remove(conn_id).is_some() {
            info!(event = "ctl_client_disconnected", conn_id = conn_id);
            let _ = self
                .events
                .send(ServerEvent::Disconnected(conn_id.to_string()));
        }
    }
}

async fn handle_connection(
    hub: Arc<Hub>,
    stream: UnixStream,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = hub.next_conn_id();
    let (mut reader, writer) = Connection::from_stream(stream, config.max_frame_bytes).split();
    let (tx, rx) = mpsc::channel::<Arc<[u8]>>(config.queue_capacity);
    let mut writer_task = tokio::spawn(writer_loop(
        conn_id.clone(),
        writer,
        rx,
        config.write_timeout,
    ));
    hub.register(conn_id.clone(), tx).await;

    let mut writer_done = false;
    loop {
        tokio::select! {
            event = read_next_valid_event(&mut reader, &conn_id, config.max_frame_bytes) => {
                let Some(event) = event else {
                    break;
                };
                debug!(event = "ctl_event_received", conn_id = %conn_id, name = %event.name);
                let _ = hub.events.send(ServerEvent::Received(conn_id.clone(), event));
            }
            _ = &mut writer_task => {
                writer_done = true;
                break;
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    hub.unregister(&conn_id).await;
    if !writer_done {
        let _ = writer_task.await;
    }
}

async fn writer_loop(
    conn_id: ClientId,
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Arc<[u8]>>,
    write_timeout: Duration,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(write_timeout, writer.write(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "ctl_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "ctl_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
    writer.close().await;
}

async fn read_next_valid_event(
    reader: &mut FrameReader,
    conn_id: &str,
    max_frame_bytes: usize,
) -> Option<Event> {
    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(err) => {
                warn!(event = "ctl_read_error", conn_id = conn_id, error = %err);
                return None;
            }
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match decode_event(&line, max_frame_bytes) {
            Ok(event) => return Some(event),
            Err(err) => {
                warn!(event = "ctl_decode_error", conn_id = conn_id, error = %err);
            }
        }
    }
}
