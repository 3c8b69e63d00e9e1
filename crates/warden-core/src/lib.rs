pub mod client;
pub mod controller;
pub mod instance;
pub mod protocol;
#[cfg(unix)]
pub mod server;
pub mod settings;
pub mod transport;

pub use client::{
    send_one_shot, BackoffPolicy, ClientOptions, SessionClient, SessionError, SessionNotice,
    SessionState,
};
pub use controller::{
    ChannelPresenter, Presenter, PresenterSignal, ServiceStatus, SessionController,
};
pub use instance::{acquire_or_signal, GuardOutcome, InstanceError, InstanceLock};
pub use protocol::{Event, EventData, EventName, FrameError, LifecycleState, UpdateChannel};
pub use settings::{JsonSettingsStore, MemorySettingsStore, SettingsSnapshot, SettingsStore};
pub use transport::{Endpoint, TransportError};
