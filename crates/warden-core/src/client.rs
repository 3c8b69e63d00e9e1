//! Persistent session with the service endpoint.
//!
//! A background task owns the reconnect-and-read loop for as long as the
//! client is running. Inbound frames are decoded and fanned out to every
//! subscriber in wire order; outbound frames go straight to the live handle.
//! Nothing is queued or replayed across connection epochs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{decode_event, encode_event, Event, FrameError, DEFAULT_MAX_FRAME_BYTES};
use crate::transport::{self, Endpoint, FrameReader, FrameWriter, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        let next = current + current;
        if next > self.max {
            self.max
        } else {
            next
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub one_shot_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            one_shot_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Connected,
    Disconnected,
    Event(Event),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to the service")]
    NotConnected,
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error(transparent)]
    Encode(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: Endpoint,
    options: ClientOptions,
    persistent: AtomicBool,
    epoch: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    live: AsyncMutex<Option<LiveHandle>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionNotice>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Write side of the current epoch. Dropping it ends the epoch's read loop.
struct LiveHandle {
    epoch: u64,
    writer: FrameWriter,
    _end_epoch: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    Closed,
    Shutdown,
}

impl SessionClient {
    pub fn new(endpoint: Endpoint, options: ClientOptions) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                options,
                persistent: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                state_tx,
                shutdown_tx,
                live: AsyncMutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Number of the current connection epoch, bumped before each
    /// `Connected` notice. Zero until the first connection.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Registers a subscriber for connection notices and inbound events.
    /// Notices published before the call are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock_or_recover(&self.shared.subscribers).push(tx);
        rx
    }

    /// Starts the reconnect loop, or restarts it after `stop`. A no-op while
    /// the loop is already running. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let mut task = lock_or_recover(&self.shared.task);
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        self.shared.persistent.store(true, Ordering::SeqCst);
        self.shared.shutdown_tx.send_replace(false);
        let shutdown = self.shared.shutdown_tx.subscribe();
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(run_loop(shared, shutdown)));
    }

    /// Stops the loop and releases the live handle, if any.
    pub async fn stop(&self) {
        self.shared.shutdown_tx.send_replace(true);
        let handle = lock_or_recover(&self.shared.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.close_writer().await;
        self.shared.set_state(SessionState::Idle);
    }

    /// Writes one event.
    ///
    /// A client whose loop was never started sends over its own short-lived
    /// connection. A running client writes on the live handle and fails with
    /// `NotConnected` between connection epochs; nothing is queued.
    ///
    /// A write that fails or times out may leave a partial frame on the
    /// wire, so the handle is closed and the epoch ends. Later sends fail
    /// with `NotConnected` until the loop reconnects.
    pub async fn send(&self, event: &Event) -> Result<(), SessionError> {
        self.send_with(event, None).await
    }

    /// Like `send`, but only writes on the handle of connection `epoch`.
    /// Any other live epoch fails with `NotConnected`.
    pub async fn send_in_epoch(&self, event: &Event, epoch: u64) -> Result<(), SessionError> {
        self.send_with(event, Some(epoch)).await
    }

    async fn send_with(&self, event: &Event, epoch: Option<u64>) -> Result<(), SessionError> {
        let options = &self.shared.options;
        if !self.shared.persistent.load(Ordering::SeqCst) {
            return send_one_shot_with(
                &self.shared.endpoint,
                event,
                options.one_shot_timeout,
                options.max_frame_bytes,
            )
            .await;
        }

        let frame = encode_event(event, options.max_frame_bytes)?;
        let mut live = self.shared.live.lock().await;
        let Some(active) = live.as_mut() else {
            debug!(event = "session_send_not_connected", name = %event.name);
            return Err(SessionError::NotConnected);
        };
        if epoch.is_some_and(|epoch| epoch != active.epoch) {
            debug!(
                event = "session_send_epoch_mismatch",
                name = %event.name,
                live_epoch = active.epoch
            );
            return Err(SessionError::NotConnected);
        }
        let result = match tokio::time::timeout(options.write_timeout, active.writer.write(&frame))
            .await
        {
            Ok(Ok(())) => {
                debug!(event = "session_event_sent", name = %event.name);
                return Ok(());
            }
            Ok(Err(err)) => {
                warn!(event = "session_write_error", name = %event.name, error = %err);
                Err(err.into())
            }
            Err(_) => {
                warn!(event = "session_write_timeout", name = %event.name);
                Err(SessionError::WriteTimeout(options.write_timeout))
            }
        };
        if let Some(mut broken) = live.take() {
            broken.writer.close().await;
        }
        result
    }
}

/// Opens a connection, writes a single event and closes it again.
pub async fn send_one_shot(
    endpoint: &Endpoint,
    event: &Event,
    timeout: Duration,
) -> Result<(), SessionError> {
    send_one_shot_with(endpoint, event, timeout, DEFAULT_MAX_FRAME_BYTES).await
}

async fn send_one_shot_with(
    endpoint: &Endpoint,
    event: &Event,
    timeout: Duration,
    max_frame_bytes: usize,
) -> Result<(), SessionError> {
    let frame = encode_event(event, max_frame_bytes)?;
    let connection = transport::connect_with_limit(endpoint, timeout, max_frame_bytes).await?;
    let (_reader, mut writer) = connection.split();
    let result = match tokio::time::timeout(timeout, writer.write(&frame)).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::WriteTimeout(timeout)),
    };
    writer.close().await;
    if result.is_ok() {
        debug!(event = "session_one_shot_sent", name = %event.name, endpoint = %endpoint);
    }
    result
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn notify(&self, notice: SessionNotice) {
        let mut subscribers = lock_or_recover(&self.subscribers);
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    async fn close_writer(&self) {
        if let Some(mut live) = self.live.lock().await.take() {
            live.writer.close().await;
        }
    }
}

async fn run_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let policy = shared.options.backoff;
    let mut backoff = policy.initial;

    loop {
        shared.set_state(SessionState::Connecting);
        let attempt = tokio::select! {
            result = transport::connect_with_limit(
                &shared.endpoint,
                shared.options.connect_timeout,
                shared.options.max_frame_bytes,
            ) => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        let Some(attempt) = attempt else {
            break;
        };

        match attempt {
            Ok(connection) => {
                backoff = policy.initial;
                let (reader, writer) = connection.split();
                let (end_epoch, epoch_ended) = oneshot::channel();
                let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                *shared.live.lock().await = Some(LiveHandle {
                    epoch,
                    writer,
                    _end_epoch: end_epoch,
                });
                shared.set_state(SessionState::Connected);
                info!(event = "session_connected", endpoint = %shared.endpoint, epoch = epoch);
                shared.notify(SessionNotice::Connected);

                let outcome = read_loop(&shared, reader, epoch_ended, &mut shutdown).await;
                shared.close_writer().await;
                if outcome == ReadOutcome::Shutdown {
                    shared.notify(SessionNotice::Disconnected);
                    break;
                }
                shared.set_state(SessionState::Connecting);
                shared.notify(SessionNotice::Disconnected);
            }
            Err(err) => {
                debug!(event = "session_connect_error", endpoint = %shared.endpoint, error = %err);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
        backoff = policy.next(backoff);
    }

    shared.close_writer().await;
    shared.set_state(SessionState::Idle);
    info!(event = "session_stopped", endpoint = %shared.endpoint);
}

async fn read_loop(
    shared: &Shared,
    mut reader: FrameReader,
    mut epoch_ended: oneshot::Receiver<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    loop {
        let line = tokio::select! {
            line = reader.read_line() => line,
            _ = &mut epoch_ended => {
                info!(event = "session_handle_dropped", endpoint = %shared.endpoint);
                return ReadOutcome::Closed;
            }
            _ = wait_for_shutdown(shutdown) => return ReadOutcome::Shutdown,
        };
        match line {
            Ok(Some(line)) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match decode_event(&line, shared.options.max_frame_bytes) {
                    Ok(event) => {
                        debug!(event = "session_event_received", name = %event.name);
                        shared.notify(SessionNotice::Event(event));
                    }
                    Err(err) => {
                        warn!(event = "session_decode_error", error = %err);
                    }
                }
            }
            Ok(None) => {
                info!(event = "session_peer_closed", endpoint = %shared.endpoint);
                return ReadOutcome::Closed;
            }
            Err(err) => {
                warn!(event = "session_read_error", endpoint = %shared.endpoint, error = %err);
                return ReadOutcome::Closed;
            }
        }
    }
}

pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::EventData;
    use std::path::{Path, PathBuf};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("warden-client-{name}-{nanos}.sock"))
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(1),
            one_shot_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::constant(Duration::from_millis(50)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    async fn accept(listener: &UnixListener) -> UnixStream {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept timeout")
            .expect("accept");
        stream
    }

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<SessionNotice>) -> SessionNotice {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("notice timeout")
            .expect("notice channel closed")
    }

    async fn read_event(reader: &mut BufReader<UnixStream>) -> Option<Event> {
        let mut line = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
            .await
            .expect("read timeout")
            .expect("read");
        if read == 0 {
            return None;
        }
        Some(decode_event(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode"))
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = BackoffPolicy::default();
        let second = policy.next(policy.initial);
        assert_eq!(second, Duration::from_secs(1));
        let mut current = second;
        for _ in 0..10 {
            current = policy.next(current);
        }
        assert_eq!(current, Duration::from_secs(5));
        let constant = BackoffPolicy::constant(Duration::from_millis(500));
        assert_eq!(constant.next(constant.initial), Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_connected_then_events_in_wire_order() {
        let path = test_path("order");
        let listener = UnixListener::bind(&path).expect("bind");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());
        let mut notices = client.subscribe();
        client.connect();

        let mut peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        assert_eq!(client.state(), SessionState::Connected);

        peer.write_all(
            b"{\"name\":\"status\",\"data\":{\"state\":\"starting\"}}\nnot json\n\n{\"data\":{}}\n{\"name\":\"status\",\"data\":{\"state\":\"started\"}}\n",
        )
        .await
        .expect("write");

        let first = next_notice(&mut notices).await;
        let second = next_notice(&mut notices).await;
        assert_eq!(
            first,
            SessionNotice::Event(Event::status(EventData {
                state: Some("starting".to_string()),
                ..EventData::default()
            }))
        );
        assert_eq!(
            second,
            SessionNotice::Event(Event::status(EventData {
                state: Some("started".to_string()),
                ..EventData::default()
            }))
        );

        client.stop().await;
        assert_eq!(client.state(), SessionState::Idle);
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnects_after_peer_closes() {
        let path = test_path("reconnect");
        let listener = UnixListener::bind(&path).expect("bind");
        let options = ClientOptions {
            backoff: BackoffPolicy::constant(Duration::from_millis(400)),
            ..fast_options()
        };
        let client = SessionClient::new(Endpoint::new(&path), options);
        let mut notices = client.subscribe();
        client.connect();

        let peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        let closed_at = Instant::now();
        drop(peer);

        assert_eq!(next_notice(&mut notices).await, SessionNotice::Disconnected);
        assert_ne!(client.state(), SessionState::Connected);
        assert!(matches!(
            client.send(&Event::enable()).await,
            Err(SessionError::NotConnected)
        ));

        let _second = accept(&listener).await;
        assert!(closed_at.elapsed() < Duration::from_secs(2));
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_is_delivered_between_eof_and_next_connected() {
        let path = test_path("eof-gap");
        let listener = UnixListener::bind(&path).expect("bind");
        let options = ClientOptions {
            backoff: BackoffPolicy::constant(Duration::from_millis(300)),
            ..fast_options()
        };
        let client = SessionClient::new(Endpoint::new(&path), options);
        let mut notices = client.subscribe();
        client.connect();

        let mut peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        assert_eq!(client.epoch(), 1);
        peer.write_all(b"{\"name\":\"status\",\"data\":{\"state\":\"started\"}}\n")
            .await
            .expect("write");
        assert!(matches!(
            next_notice(&mut notices).await,
            SessionNotice::Event(_)
        ));

        peer.shutdown().await.expect("half close");
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Disconnected);
        let _ = peer.write_all(b"{\"name\":\"open\"}\n").await;

        let _second = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        assert_eq!(client.epoch(), 2);
        assert!(notices.try_recv().is_err());

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_write_ends_epoch_instead_of_corrupting_next_frame() {
        let path = test_path("write-timeout");
        let listener = UnixListener::bind(&path).expect("bind");
        let options = ClientOptions {
            write_timeout: Duration::from_millis(200),
            max_frame_bytes: 4 * 1024 * 1024,
            backoff: BackoffPolicy::constant(Duration::from_millis(100)),
            ..fast_options()
        };
        let client = SessionClient::new(Endpoint::new(&path), options);
        let mut notices = client.subscribe();
        client.connect();

        let peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);

        let oversized = Event::settings(EventData {
            configuration: Some("x".repeat(2 * 1024 * 1024)),
            ..EventData::default()
        });
        assert!(matches!(
            client.send(&oversized).await,
            Err(SessionError::WriteTimeout(_))
        ));
        assert!(matches!(
            client.send(&Event::enable()).await,
            Err(SessionError::NotConnected)
        ));
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Disconnected);

        let mut raw = Vec::new();
        let mut reader = BufReader::new(peer);
        tokio::time::timeout(Duration::from_secs(3), reader.read_to_end(&mut raw))
            .await
            .expect("drain timeout")
            .expect("drain");
        assert!(!raw.is_empty());
        assert!(!raw.contains(&b'\n'));

        let _again = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        client.send(&Event::enable()).await.expect("send after reconnect");

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn keeps_retrying_until_endpoint_appears() {
        let path = test_path("late");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());
        let mut state = client.watch_state();
        client.connect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.state(), SessionState::Connecting);

        let listener = UnixListener::bind(&path).expect("bind");
        let _peer = accept(&listener).await;
        tokio::time::timeout(
            Duration::from_secs(3),
            state.wait_for(|value| *value == SessionState::Connected),
        )
        .await
        .expect("connected timeout")
        .expect("state channel");

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_sends_do_not_interleave() {
        let path = test_path("concurrent");
        let listener = UnixListener::bind(&path).expect("bind");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());
        let mut notices = client.subscribe();
        client.connect();

        let peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);

        let mut sends = Vec::new();
        for idx in 0..16 {
            let client = client.clone();
            sends.push(tokio::spawn(async move {
                client
                    .send(&Event::settings(EventData {
                        configuration: Some(format!("config-{idx}-{}", "x".repeat(2048))),
                        ..EventData::default()
                    }))
                    .await
            }));
        }
        for send in sends {
            send.await.expect("join").expect("send");
        }

        let mut reader = BufReader::new(peer);
        for _ in 0..16 {
            let event = read_event(&mut reader).await.expect("frame");
            assert_eq!(event.name, "settings");
        }

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn epoch_targeted_send_rejects_other_epochs() {
        let path = test_path("epoch");
        let listener = UnixListener::bind(&path).expect("bind");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());
        let mut notices = client.subscribe();
        client.connect();

        let peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        let live = client.epoch();
        assert!(matches!(
            client.send_in_epoch(&Event::enable(), live - 1).await,
            Err(SessionError::NotConnected)
        ));
        client
            .send_in_epoch(&Event::disable(), live)
            .await
            .expect("send in live epoch");

        let mut reader = BufReader::new(peer);
        assert_eq!(read_event(&mut reader).await, Some(Event::disable()));

        client.stop().await;
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unstarted_client_sends_one_shot() {
        let path = test_path("one-shot");
        let listener = UnixListener::bind(&path).expect("bind");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut reader = BufReader::new(stream);
            let first = read_event(&mut reader).await;
            let after = read_event(&mut reader).await;
            (first, after)
        });

        client.send(&Event::open()).await.expect("one-shot send");
        let (first, after) = server.await.expect("join");
        assert_eq!(first, Some(Event::open()));
        assert_eq!(after, None);
        assert_eq!(client.state(), SessionState::Idle);
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn one_shot_to_missing_endpoint_fails_cleanly() {
        let path = test_path("one-shot-missing");
        let result = send_one_shot(
            &Endpoint::new(&path),
            &Event::open(),
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Connect { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_closes_handle_and_connect_restarts() {
        let path = test_path("restart");
        let listener = UnixListener::bind(&path).expect("bind");
        let client = SessionClient::new(Endpoint::new(&path), fast_options());
        let mut notices = client.subscribe();
        client.connect();

        let peer = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);

        client.stop().await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Disconnected);
        assert_eq!(client.state(), SessionState::Idle);
        let mut reader = BufReader::new(peer);
        assert_eq!(read_event(&mut reader).await, None);
        assert!(matches!(
            client.send(&Event::status_query()).await,
            Err(SessionError::NotConnected)
        ));

        client.connect();
        let _again = accept(&listener).await;
        assert_eq!(next_notice(&mut notices).await, SessionNotice::Connected);
        client.stop().await;
        cleanup(&path);
    }
}
