//! High-level client: one session plus its dispatcher, log and poller.

use derive_more::{Display, Error};
use log::{info, warn};
use roverlink_protocol::{Command, ProtocolCodec, Request, Role, WireFormat};
use roverlink_telemetry_log::TelemetryLogger;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::config::ClientConfig;
use crate::connection::{self, ConnectionError, ConnectionSettings, ConnectionState, Session, Transport};
use crate::dispatcher::{DisplayHandle, DisplayState, MessageDispatcher, Notice};
use crate::poller::PollScheduler;

/// Errors from sending a command or request
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum CommandError {
    #[display("{role} sessions may not send commands")]
    Unauthorized { role: Role },
    #[display("unknown command {input:?}")]
    UnknownCommand { input: String },
    #[display("{wire_format} format has no {request:?} request")]
    Unsupported { request: Request, wire_format: WireFormat },
    #[display("{_0}")]
    Connection(ConnectionError),
}

impl From<ConnectionError> for CommandError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

/// Receiving ends for the presentation layer
pub struct ClientHandles {
    /// A new snapshot for every telemetry event
    pub states: Receiver<Arc<DisplayState>>,
    pub notices: Receiver<Notice>,
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            role: config.role,
            token: config.token.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Write a command if `role` is allowed to. Nothing is written otherwise.
fn send_authorized(
    transport: &dyn Transport,
    role: Role,
    codec: &dyn ProtocolCodec,
    command: Command,
) -> Result<(), CommandError> {
    if !role.can_command() {
        return Err(CommandError::Unauthorized { role });
    }
    transport.send(&codec.encode_command(command))?;
    Ok(())
}

pub struct Client {
    session: Arc<Session>,
    codec: Arc<dyn ProtocolCodec>,
    display: DisplayHandle,
    notice_tx: Sender<Notice>,
    poller: Mutex<Option<PollScheduler>>,
}

impl Client {
    /// Connect and, unless the handshake timeout is zero, wait for the
    /// handshake to finish.
    ///
    /// After authentication one data request is sent right away and the
    /// poller is started when enabled and the wire format supports it.
    pub fn connect(config: &ClientConfig) -> Result<(Self, ClientHandles), ConnectionError> {
        let codec: Arc<dyn ProtocolCodec> = Arc::from(config.wire_format.codec());
        let (state_tx, states) = mpsc::channel();
        let (notice_tx, notices) = mpsc::channel();

        let logger = TelemetryLogger::open_today(&config.log_dir, config.log_format);
        let mut dispatcher = MessageDispatcher::new(logger, state_tx, notice_tx.clone());
        let display = dispatcher.display();
        let error_tx = notice_tx.clone();

        let session = connection::connect(
            &ConnectionSettings::from(config),
            Arc::clone(&codec),
            move |event| dispatcher.dispatch(event),
            move |error: &ConnectionError| {
                let _ = error_tx.send(Notice::Status(format!("Disconnected: {error}")));
            },
        )?;

        let client = Self {
            session: Arc::new(session),
            codec,
            display,
            notice_tx,
            poller: Mutex::new(None),
        };

        if let Some(timeout) = config.handshake_timeout() {
            if let Err(e) = client.session.wait_authenticated(timeout) {
                warn!("Handshake did not complete: {e}");
                client.close();
                return Err(e);
            }
        }

        if client.state() == ConnectionState::Authenticated {
            match client.request(Request::GetData) {
                Ok(()) | Err(CommandError::Unsupported { .. }) => {}
                Err(e) => warn!("Initial data request failed: {e}"),
            }
        }
        if config.poll_enabled {
            client.start_poller(config);
        }

        Ok((client, ClientHandles { states, notices }))
    }

    fn start_poller(&self, config: &ClientConfig) {
        let Some(request) = self.codec.encode_request(Request::GetData) else {
            info!(
                "{} format has no data request, polling disabled",
                self.codec.wire_format()
            );
            return;
        };
        let transport: Arc<dyn Transport> = self.session.clone();
        match PollScheduler::start(transport, request, config.poll_interval()) {
            Ok(poller) => *self.poller.lock().unwrap() = Some(poller),
            Err(e) => warn!("Failed to start poller: {e}"),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.session.role()
    }

    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(PollScheduler::is_running)
    }

    /// Latest telemetry snapshot
    #[must_use]
    pub fn display(&self) -> Arc<DisplayState> {
        self.display.latest()
    }

    #[must_use]
    pub fn display_handle(&self) -> DisplayHandle {
        self.display.clone()
    }

    /// Send a vehicle command. Observers are refused before anything is written.
    pub fn send_command(&self, command: Command) -> Result<(), CommandError> {
        let result = send_authorized(self.session.as_ref(), self.role(), self.codec.as_ref(), command);
        match &result {
            Ok(()) => info!("Sent command {command}"),
            Err(CommandError::Unauthorized { role }) => {
                warn!("Refusing {command}: role {role} may not send commands");
                self.status(format!("Not authorized: {role} cannot send {command}"));
            }
            Err(e) => self.status(format!("Command {command} failed: {e}")),
        }
        result
    }

    /// Parse user input (`speed up`, `SPEED_UP`, `speed-up`) and send it.
    pub fn trigger(&self, input: &str) -> Result<Command, CommandError> {
        let command: Command = input.parse().map_err(|_| CommandError::UnknownCommand {
            input: input.trim().to_string(),
        })?;
        self.send_command(command)?;
        Ok(command)
    }

    pub fn request(&self, request: Request) -> Result<(), CommandError> {
        let bytes = self
            .codec
            .encode_request(request)
            .ok_or(CommandError::Unsupported {
                request,
                wire_format: self.codec.wire_format(),
            })?;
        self.session.send(&bytes)?;
        Ok(())
    }

    /// Shut down the session, the receive thread and the poller. Idempotent.
    pub fn close(&self) {
        self.session.close();
        self.session.join();
        let poller = self.poller.lock().unwrap().take();
        if let Some(mut poller) = poller {
            poller.stop();
        }
    }

    fn status(&self, text: String) {
        let _ = self.notice_tx.send(Notice::Status(text));
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
