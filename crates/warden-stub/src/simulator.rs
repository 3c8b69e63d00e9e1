//! Lifecycle simulation for the development service.

use tracing::debug;
use warden_core::{Event, EventData, EventName, LifecycleState, SettingsSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Broadcast(Event),
    /// Complete the pending transition of this generation after the settle
    /// delay.
    Settle(u64),
}

#[derive(Debug, Default)]
pub struct Simulator {
    state: LifecycleState,
    error: Option<String>,
    settings: SettingsSnapshot,
    generation: u64,
    fail_with: Option<String>,
}

impl Simulator {
    /// `fail_with` makes every start attempt end stopped with that error.
    pub fn new(fail_with: Option<String>) -> Self {
        Self {
            fail_with,
            ..Self::default()
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn settings(&self) -> &SettingsSnapshot {
        &self.settings
    }

    pub fn status_event(&self) -> Event {
        let mut data = EventData::with_state(self.state);
        data.enabled = Some(self.state.is_running());
        data.error = self.error.clone();
        Event::status(data)
    }

    pub fn handle(&mut self, event: &Event) -> Vec<Step> {
        match event.kind() {
            EventName::Status => vec![Step::Broadcast(self.status_event())],
            EventName::Enable => self.begin(true),
            EventName::Disable => self.begin(false),
            EventName::Settings => {
                let Some(data) = event.data.as_ref() else {
                    return Vec::new();
                };
                self.settings.merge_event_data(data);
                match data.enabled {
                    Some(enabled) => self.begin(enabled),
                    None => Vec::new(),
                }
            }
            EventName::Open => vec![Step::Broadcast(Event::open())],
            EventName::Error | EventName::Other(_) => {
                debug!(event = "stub_ignored_event", name = %event.name);
                Vec::new()
            }
        }
    }

    fn begin(&mut self, enable: bool) -> Vec<Step> {
        let already = if enable {
            matches!(
                self.state,
                LifecycleState::Starting | LifecycleState::Started | LifecycleState::Reasserting
            )
        } else {
            matches!(self.state, LifecycleState::Stopping | LifecycleState::Stopped)
        };
        if already {
            return Vec::new();
        }

        self.generation += 1;
        self.error = None;
        self.state = if enable {
            LifecycleState::Starting
        } else {
            LifecycleState::Stopping
        };
        vec![
            Step::Broadcast(self.status_event()),
            Step::Settle(self.generation),
        ]
    }

    /// Finishes a transition. Stale generations are ignored.
    pub fn settle(&mut self, generation: u64) -> Vec<Step> {
        if generation != self.generation {
            return Vec::new();
        }
        match self.state {
            LifecycleState::Starting => match self.fail_with.clone() {
                Some(message) => {
                    self.state = LifecycleState::Stopped;
                    self.error = Some(message.clone());
                    vec![
                        Step::Broadcast(self.status_event()),
                        Step::Broadcast(Event::error(message)),
                    ]
                }
                None => {
                    self.state = LifecycleState::Started;
                    vec![Step::Broadcast(self.status_event())]
                }
            },
            LifecycleState::Stopping => {
                self.state = LifecycleState::Stopped;
                vec![Step::Broadcast(self.status_event())]
            }
            _ => Vec::new(),
        }
    }
}
