//! Routes decoded events to the display, the notice sink and the telemetry log.

use log::{debug, info, warn};
use roverlink_protocol::{Event, Telemetry, TelemetryOrigin, DEFAULT_DIR};
use roverlink_telemetry_log::{human_time, TelemetryLogger};
use std::fmt::Display;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// Latest vehicle status shown to the user. All fields are `None` until the
/// first telemetry event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub speed: Option<i64>,
    pub battery: Option<i64>,
    pub temp: Option<i64>,
    pub dir: Option<String>,
    pub last_update_ts: Option<i64>,
    pub last_origin: Option<TelemetryOrigin>,
}

fn or_dash(value: Option<impl Display>) -> String {
    value.map_or_else(|| DEFAULT_DIR.to_string(), |v| v.to_string())
}

impl DisplayState {
    #[must_use]
    pub fn from_telemetry(telemetry: &Telemetry) -> Self {
        Self {
            speed: Some(telemetry.speed),
            battery: Some(telemetry.battery),
            temp: Some(telemetry.temp),
            dir: Some(telemetry.dir.clone()),
            last_update_ts: Some(telemetry.ts),
            last_origin: Some(telemetry.origin),
        }
    }

    /// One-line rendering, `--` for anything not yet received
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "speed={} battery={}% temp={}C dir={} updated={} ({})",
            or_dash(self.speed),
            or_dash(self.battery),
            or_dash(self.temp),
            self.dir.as_deref().unwrap_or(DEFAULT_DIR),
            self.last_update_ts.map_or_else(|| DEFAULT_DIR.to_string(), human_time),
            self.last_origin.map_or(DEFAULT_DIR, TelemetryOrigin::wire_name),
        )
    }
}

/// Text for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Handshake and command outcomes
    Status(String),
    /// Everything else worth showing
    Info(String),
}

impl Notice {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Status(text) | Self::Info(text) => text,
        }
    }
}

/// Read access to the most recent [`DisplayState`].
///
/// Snapshots are replaced whole, so a reader never sees fields from two
/// different events.
#[derive(Debug, Clone, Default)]
pub struct DisplayHandle(Arc<Mutex<Arc<DisplayState>>>);

impl DisplayHandle {
    #[must_use]
    pub fn latest(&self) -> Arc<DisplayState> {
        Arc::clone(&self.0.lock().unwrap())
    }

    fn publish(&self, state: Arc<DisplayState>) {
        *self.0.lock().unwrap() = state;
    }
}

pub struct MessageDispatcher {
    logger: TelemetryLogger,
    display: DisplayHandle,
    state_tx: Sender<Arc<DisplayState>>,
    notice_tx: Sender<Notice>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new(
        logger: TelemetryLogger,
        state_tx: Sender<Arc<DisplayState>>,
        notice_tx: Sender<Notice>,
    ) -> Self {
        Self {
            logger,
            display: DisplayHandle::default(),
            state_tx,
            notice_tx,
        }
    }

    #[must_use]
    pub fn display(&self) -> DisplayHandle {
        self.display.clone()
    }

    #[must_use]
    pub const fn logger(&self) -> &TelemetryLogger {
        &self.logger
    }

    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Telemetry(telemetry) => {
                let snapshot = Arc::new(DisplayState::from_telemetry(&telemetry));
                self.display.publish(Arc::clone(&snapshot));
                // The presentation side may already be gone
                let _ = self.state_tx.send(snapshot);
                self.logger.record(&telemetry);
            }
            Event::HandshakeResult { role } => {
                info!("Server granted role {role}");
                self.status(format!("Authenticated as {role}"));
            }
            Event::Subscribed => self.status("Subscribed to telemetry".to_string()),
            Event::Ack { name } => self.status(format!("ACK {name}")),
            Event::Nack { name, reason } => {
                warn!("Command {name} refused: {reason}");
                self.status(format!("NACK {name} ({reason})"));
            }
            Event::Error { code } => {
                warn!("Server error: {code}");
                self.status(format!("ERROR: {code}"));
            }
            Event::UserList { count } => {
                debug!("User list: {count} entries");
                self.info(format!("{count} users connected"));
            }
            Event::UserEntry { raw } => self.info(format!("user {raw}")),
            Event::Pong => {
                debug!("PONG");
                self.info("PONG".to_string());
            }
            Event::Unknown { raw } => {
                warn!("Unrecognized message: {raw}");
                self.info(format!("unrecognized: {raw}"));
            }
        }
    }

    fn status(&self, text: String) {
        let _ = self.notice_tx.send(Notice::Status(text));
    }

    fn info(&self, text: String) {
        let _ = self.notice_tx.send(Notice::Info(text));
    }
}
