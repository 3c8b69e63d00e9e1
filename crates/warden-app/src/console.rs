//! Line-oriented front-end: reads commands from stdin and renders controller
//! callbacks as text.

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use warden_core::{EventData, Presenter, ServiceStatus, SessionController, SessionError, UpdateChannel};

const HELP: &str = "commands: enable | disable | toggle | status | settings | config <id> | \
report-device-name on|off | check-updates on|off | channel stable|beta | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable,
    Disable,
    Toggle,
    Status,
    ShowSettings,
    Configuration(String),
    ReportDeviceName(bool),
    CheckUpdates(bool),
    Channel(UpdateChannel),
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    let command = match (verb.to_ascii_lowercase().as_str(), arg) {
        ("enable", None) => Command::Enable,
        ("disable", None) => Command::Disable,
        ("toggle", None) => Command::Toggle,
        ("status", None) => Command::Status,
        ("settings", None) => Command::ShowSettings,
        ("config" | "configuration", Some(id)) => Command::Configuration(id.to_string()),
        ("config" | "configuration", None) => Command::Configuration(String::new()),
        ("report-device-name", Some(value)) => Command::ReportDeviceName(parse_switch(value)?),
        ("check-updates", Some(value)) => Command::CheckUpdates(parse_switch(value)?),
        ("channel", Some(value)) => match value.to_ascii_lowercase().as_str() {
            "stable" => Command::Channel(UpdateChannel::Stable),
            "beta" => Command::Channel(UpdateChannel::Beta),
            other => return Err(format!("unknown update channel: {other}")),
        },
        ("help" | "?", None) => Command::Help,
        ("quit" | "exit", None) => Command::Quit,
        _ => return Err(format!("unrecognised command: {}", line.trim())),
    };
    if parts.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }
    Ok(Some(command))
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected on or off, got {other}")),
    }
}

/// Runs until `quit` or end of input.
pub async fn run(controller: SessionController, presenter: Arc<ConsolePresenter>) {
    let mut lines = spawn_stdin_reader();
    while let Some(line) = lines.recv().await {
        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => apply(&controller, &presenter, command).await,
            Err(message) => presenter.line(&message),
        }
    }
}

/// Blocking stdin reads live on their own thread so an interrupted runtime
/// can shut down without waiting for the next line.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn apply(controller: &SessionController, presenter: &ConsolePresenter, command: Command) {
    // Send failures already reach the presenter through `send_failed`.
    match command {
        Command::Enable => {
            let _ = controller.enable().await;
        }
        Command::Disable => {
            let _ = controller.disable().await;
        }
        Command::Toggle => {
            let _ = controller.toggle().await;
        }
        Command::Status => {
            presenter.show_status(&controller.status());
            let _ = controller.refresh().await;
        }
        Command::ShowSettings => {
            let settings = controller.settings();
            presenter.line(&format!(
                "configuration={} report-device-name={} check-updates={} channel={} enabled={}",
                display_or_none(&settings.configuration),
                settings.report_device_name,
                settings.check_updates,
                settings.update_channel,
                settings.desired_enabled
            ));
        }
        Command::Configuration(id) => {
            update(controller, presenter, |settings| settings.configuration = id);
        }
        Command::ReportDeviceName(value) => {
            update(controller, presenter, |settings| {
                settings.report_device_name = value
            });
        }
        Command::CheckUpdates(value) => {
            update(controller, presenter, |settings| settings.check_updates = value);
        }
        Command::Channel(channel) => {
            update(controller, presenter, |settings| settings.update_channel = channel);
        }
        Command::Help => presenter.line(HELP),
        Command::Quit => {}
    }
}

fn update(
    controller: &SessionController,
    presenter: &ConsolePresenter,
    change: impl FnOnce(&mut warden_core::SettingsSnapshot),
) {
    let mut settings = controller.settings();
    change(&mut settings);
    if let Err(err) = controller.update_settings(settings) {
        presenter.line(&format!("could not save settings: {err}"));
    }
}

fn display_or_none(value: &str) -> &str {
    if value.is_empty() {
        "<none>"
    } else {
        value
    }
}

pub struct ConsolePresenter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsolePresenter {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{text}");
            let _ = out.flush();
        }
    }

    pub fn banner(&self, status: &ServiceStatus) {
        self.line("warden companion; type `help` for commands");
        self.show_status(status);
    }

    pub fn show_status(&self, status: &ServiceStatus) {
        let mut text = format!("service {} [{}]", status.state, status.toggle_label());
        if let Some(error) = &status.error {
            text.push_str(&format!(" error: {error}"));
        }
        self.line(&text);
    }
}

impl Presenter for ConsolePresenter {
    fn connected(&self) {
        self.line("connected to service");
    }

    fn disconnected(&self) {
        self.line("service unavailable, reconnecting");
    }

    fn status_changed(&self, status: &ServiceStatus) {
        self.show_status(status);
    }

    fn open_requested(&self) {
        self.line("another launch asked for this window");
    }

    fn settings_received(&self, data: &EventData) {
        self.line(&format!(
            "service settings: configuration={} enabled={}",
            data.configuration.as_deref().map(display_or_none).unwrap_or("<unset>"),
            data.enabled
                .map(|enabled| enabled.to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        ));
    }

    fn service_error(&self, message: &str) {
        self.line(&format!("service error: {message}"));
    }

    fn send_failed(&self, name: &str, error: &SessionError) {
        self.line(&format!("{name} not delivered: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::LifecycleState;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().expect("buffer").clone()).expect("utf8")
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("   "), Ok(None));
        assert_eq!(parse_command("Enable"), Ok(Some(Command::Enable)));
        assert_eq!(
            parse_command("config abc123"),
            Ok(Some(Command::Configuration("abc123".to_string())))
        );
        assert_eq!(
            parse_command("config"),
            Ok(Some(Command::Configuration(String::new())))
        );
        assert_eq!(
            parse_command("report-device-name off"),
            Ok(Some(Command::ReportDeviceName(false)))
        );
        assert_eq!(
            parse_command("channel BETA"),
            Ok(Some(Command::Channel(UpdateChannel::Beta)))
        );
        assert_eq!(parse_command("exit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("channel nightly").is_err());
        assert!(parse_command("check-updates maybe").is_err());
        assert!(parse_command("enable now").is_err());
        assert!(parse_command("reboot").is_err());
    }

    #[test]
    fn renders_status_with_label_and_error() {
        let captured = Captured::default();
        let presenter = ConsolePresenter::new(Box::new(captured.clone()));
        presenter.status_changed(&ServiceStatus {
            state: LifecycleState::Starting,
            error: None,
        });
        presenter.status_changed(&ServiceStatus {
            state: LifecycleState::Started,
            error: Some("captive portal".to_string()),
        });
        presenter.send_failed("enable", &SessionError::NotConnected);
        assert_eq!(
            captured.text(),
            "service starting [Connecting…]\n\
             service started [Disable] error: captive portal\n\
             enable not delivered: not connected to the service\n"
        );
    }
}
