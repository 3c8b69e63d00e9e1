//! Application-side protocol semantics.
//!
//! The controller mirrors the service lifecycle from inbound `status`
//! events and resynchronises on every new connection epoch by asking for
//! the authoritative status and pushing the stored settings, in that order.
//! Other outbound traffic waits until the current epoch has been
//! resynchronised.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::client::{SessionClient, SessionError, SessionNotice, SessionState};
use crate::protocol::{Event, EventData, EventName, LifecycleState};
use crate::settings::{SettingsError, SettingsSnapshot, SettingsStore};

/// Presentation boundary. Callbacks run on the controller task; an
/// implementation with thread affinity must re-dispatch itself.
pub trait Presenter: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
    fn status_changed(&self, _status: &ServiceStatus) {}
    fn open_requested(&self) {}
    fn settings_received(&self, _data: &EventData) {}
    fn service_error(&self, _message: &str) {}
    fn send_failed(&self, _name: &str, _error: &SessionError) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: LifecycleState,
    pub error: Option<String>,
}

impl ServiceStatus {
    /// Adopts a `status` payload verbatim. Returns true when anything changed.
    pub fn apply(&mut self, data: &EventData) -> bool {
        let mut changed = false;
        if let Some(state) = data.lifecycle() {
            if state != self.state {
                self.state = state;
                changed = true;
            }
        }
        let error = data.error_message().map(str::to_string);
        if error != self.error {
            self.error = error;
            changed = true;
        }
        changed
    }

    pub fn toggle_label(&self) -> &'static str {
        match self.state {
            LifecycleState::Stopped => "Enable",
            LifecycleState::Starting => "Connecting…",
            LifecycleState::Started => "Disable",
            LifecycleState::Stopping => "Disconnecting…",
            LifecycleState::Reasserting => "Reconnecting…",
        }
    }

    /// Event a toggle button sends from this state.
    pub fn toggle_event(&self) -> Event {
        match self.state {
            LifecycleState::Stopped | LifecycleState::Stopping => Event::enable(),
            LifecycleState::Starting | LifecycleState::Started | LifecycleState::Reasserting => {
                Event::disable()
            }
        }
    }
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    client: SessionClient,
    settings: Arc<dyn SettingsStore>,
    presenter: Arc<dyn Presenter>,
    status: watch::Sender<ServiceStatus>,
    outbound: AsyncMutex<()>,
    /// Client epoch whose handshake has completed.
    synced_epoch: watch::Sender<u64>,
}

impl SessionController {
    pub fn new(
        client: SessionClient,
        settings: Arc<dyn SettingsStore>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        let (status, _) = watch::channel(ServiceStatus::default());
        let (synced_epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                client,
                settings,
                presenter,
                status,
                outbound: AsyncMutex::new(()),
                synced_epoch,
            }),
        }
    }

    pub fn client(&self) -> &SessionClient {
        &self.inner.client
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ServiceStatus> {
        self.inner.status.subscribe()
    }

    pub fn settings(&self) -> SettingsSnapshot {
        self.inner.settings.read()
    }

    /// Drives the session until `shutdown` flips to true, then stops the
    /// client.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut notices = self.inner.client.subscribe();
        let mut settings_rx = self.inner.settings.changes();
        let mut last_settings = settings_rx.borrow_and_update().clone();
        let mut settings_open = true;
        self.inner.client.connect();

        loop {
            tokio::select! {
                notice = notices.recv() => {
                    match notice {
                        Some(notice) => self.handle_notice(notice).await,
                        None => break,
                    }
                }
                changed = settings_rx.changed(), if settings_open => {
                    if changed.is_err() {
                        settings_open = false;
                        continue;
                    }
                    let snapshot = settings_rx.borrow_and_update().clone();
                    let preferences_changed = !snapshot.same_preferences(&last_settings);
                    last_settings = snapshot;
                    if preferences_changed {
                        self.push_settings_if_synced().await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.inner.client.stop().await;
        info!(event = "controller_stopped");
    }

    /// Handles one notice from the session client.
    pub async fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::Connected => self.resynchronize().await,
            SessionNotice::Disconnected => {
                self.inner.presenter.disconnected();
            }
            SessionNotice::Event(event) => self.handle_event(event),
        }
    }

    fn handle_event(&self, event: Event) {
        match event.kind() {
            EventName::Status => {
                let Some(data) = event.data.as_ref() else {
                    debug!(event = "controller_status_without_data");
                    return;
                };
                if let Some(raw) = data.state.as_deref() {
                    if raw.parse::<LifecycleState>().is_err() {
                        warn!(event = "controller_unknown_state", state = raw);
                    }
                }
                let mut status = self.status();
                if status.apply(data) {
                    info!(
                        event = "controller_status",
                        state = %status.state,
                        error = status.error.as_deref().unwrap_or_default()
                    );
                    self.inner.status.send_replace(status.clone());
                    self.inner.presenter.status_changed(&status);
                }
                if let Some(message) = data.error_message() {
                    self.inner.presenter.service_error(message);
                }
            }
            EventName::Open => {
                info!(event = "controller_open_requested");
                self.inner.presenter.open_requested();
            }
            EventName::Settings => {
                if let Some(data) = event.data.as_ref() {
                    self.inner.presenter.settings_received(data);
                }
            }
            EventName::Error => {
                let message = event
                    .data
                    .as_ref()
                    .and_then(EventData::error_message)
                    .unwrap_or("unknown service error");
                warn!(event = "controller_service_error", message = message);
                self.inner.presenter.service_error(message);
            }
            EventName::Enable | EventName::Disable | EventName::Other(_) => {
                debug!(event = "controller_ignored_event", name = %event.name);
            }
        }
    }

    async fn resynchronize(&self) {
        let _outbound = self.inner.outbound.lock().await;
        let epoch = self.inner.client.epoch();
        self.inner.presenter.connected();
        let snapshot = self.inner.settings.read();
        let _ = self.send_reported(&Event::status_query(), epoch).await;
        let _ = self
            .send_reported(&Event::settings(snapshot.to_event_data()), epoch)
            .await;
        self.inner.synced_epoch.send_replace(epoch);
        debug!(event = "controller_resynchronized", epoch = epoch);
    }

    /// Takes the outbound lock once the live epoch has been resynchronised.
    /// Without a live connection the lock is returned at once and the send
    /// fails (or goes one-shot) in the client. Sends made under the guard
    /// target `synced_epoch`, so a newer epoch that has not finished its
    /// handshake rejects them.
    async fn outbound_after_resync(&self) -> tokio::sync::MutexGuard<'_, ()> {
        let mut synced = self.inner.synced_epoch.subscribe();
        let mut state = self.inner.client.watch_state();
        loop {
            synced.borrow_and_update();
            state.borrow_and_update();
            if self.resynced_or_offline() {
                let guard = self.inner.outbound.lock().await;
                if self.resynced_or_offline() {
                    return guard;
                }
                drop(guard);
                continue;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return self.inner.outbound.lock().await;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return self.inner.outbound.lock().await;
                    }
                }
            }
        }
    }

    fn resynced_or_offline(&self) -> bool {
        self.inner.client.state() != SessionState::Connected
            || *self.inner.synced_epoch.borrow() == self.inner.client.epoch()
    }

    pub async fn enable(&self) -> Result<(), SessionError> {
        self.set_desired_enabled(true);
        let _outbound = self.outbound_after_resync().await;
        self.send_synced(&Event::enable()).await
    }

    pub async fn disable(&self) -> Result<(), SessionError> {
        self.set_desired_enabled(false);
        let _outbound = self.outbound_after_resync().await;
        self.send_synced(&Event::disable()).await
    }

    pub async fn toggle(&self) -> Result<(), SessionError> {
        if self.status().toggle_event().name == EventName::ENABLE {
            self.enable().await
        } else {
            self.disable().await
        }
    }

    /// Asks the service for its current status.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        let _outbound = self.outbound_after_resync().await;
        self.send_synced(&Event::status_query()).await
    }

    /// Commits a settings snapshot. The running controller pushes it to the
    /// service when the store reports the change.
    pub fn update_settings(&self, snapshot: SettingsSnapshot) -> Result<(), SettingsError> {
        self.inner.settings.write(snapshot)
    }

    pub async fn push_settings(&self) -> Result<(), SessionError> {
        let _outbound = self.outbound_after_resync().await;
        let snapshot = self.inner.settings.read();
        self.send_synced(&Event::settings(snapshot.to_event_data()))
            .await
    }

    /// Store-change push from the run loop. A pending handshake already
    /// carries the latest snapshot, and waiting for it here would stall the
    /// loop that performs it.
    async fn push_settings_if_synced(&self) {
        if self.resynced_or_offline() {
            let _outbound = self.inner.outbound.lock().await;
            if self.resynced_or_offline() {
                let snapshot = self.inner.settings.read();
                let _ = self
                    .send_synced(&Event::settings(snapshot.to_event_data()))
                    .await;
                return;
            }
        }
        debug!(event = "controller_push_deferred_to_resync");
    }

    fn set_desired_enabled(&self, enabled: bool) {
        let mut snapshot = self.inner.settings.read();
        if snapshot.desired_enabled == enabled {
            return;
        }
        snapshot.desired_enabled = enabled;
        if let Err(err) = self.inner.settings.write(snapshot) {
            warn!(event = "controller_settings_write_error", error = %err);
        }
    }

    async fn send_synced(&self, event: &Event) -> Result<(), SessionError> {
        let epoch = *self.inner.synced_epoch.borrow();
        self.send_reported(event, epoch).await
    }

    async fn send_reported(&self, event: &Event, epoch: u64) -> Result<(), SessionError> {
        match self.inner.client.send_in_epoch(event, epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(event = "controller_send_failed", name = %event.name, error = %err);
                self.inner.presenter.send_failed(&event.name, &err);
                Err(err)
            }
        }
    }
}

/// Presenter that forwards every callback into a channel, for front-ends
/// that consume them on their own task.
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresenterSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterSignal {
    Connected,
    Disconnected,
    Status(ServiceStatus),
    Open,
    Settings(EventData),
    ServiceError(String),
    SendFailed { name: String, error: String },
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenterSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, signal: PresenterSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Presenter for ChannelPresenter {
    fn connected(&self) {
        self.emit(PresenterSignal::Connected);
    }

    fn disconnected(&self) {
        self.emit(PresenterSignal::Disconnected);
    }

    fn status_changed(&self, status: &ServiceStatus) {
        self.emit(PresenterSignal::Status(status.clone()));
    }

    fn open_requested(&self) {
        self.emit(PresenterSignal::Open);
    }

    fn settings_received(&self, data: &EventData) {
        self.emit(PresenterSignal::Settings(data.clone()));
    }

    fn service_error(&self, message: &str) {
        self.emit(PresenterSignal::ServiceError(message.to_string()));
    }

    fn send_failed(&self, name: &str, error: &SessionError) {
        self.emit(PresenterSignal::SendFailed {
            name: name.to_string(),
            error: error.to_string(),
        });
    }
}
