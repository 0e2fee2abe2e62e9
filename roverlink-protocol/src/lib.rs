//! Rover telemetry/control protocol
//!
//! This library defines the event and command model shared by both wire
//! formats spoken by the vehicle-control service, plus the two codecs:
//!
//! - [`StructuredCodec`]: one JSON object per line, discriminated by `"t"`
//! - [`TokenizedCodec`]: verb-first text lines (`TLP/1.0`)
//!
//! Codecs are pure: they never touch a socket and never fail. Anything that
//! cannot be understood decodes to [`Event::Unknown`] or to a telemetry event
//! with defaulted fields.

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

mod structured;
mod tokenized;

pub use structured::StructuredCodec;
pub use tokenized::TokenizedCodec;

/// Direction shown when a telemetry line carries no usable `dir` field.
pub const DEFAULT_DIR: &str = "--";

/// Error returned when a textual value names no known variant.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Session role requested during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May issue vehicle commands; authenticates with a token
    #[display("ADMIN")]
    Admin,
    /// Read-only telemetry subscriber
    #[default]
    #[display("OBSERVER")]
    Observer,
}

impl Role {
    /// Name used for this role on the wire.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Observer => "OBSERVER",
        }
    }

    /// Whether this role is allowed to send [`Command`]s.
    #[must_use]
    pub const fn can_command(self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Whether a role name reported by the peer designates this role.
    #[must_use]
    pub fn matches(self, reported: &str) -> bool {
        reported.trim().eq_ignore_ascii_case(self.wire_name())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "observer" => Ok(Self::Observer),
            _ => Err(UnknownVariant::new("role", s)),
        }
    }
}

/// Vehicle control command (admin only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Command {
    #[display("SPEED_UP")]
    SpeedUp,
    #[display("SLOW_DOWN")]
    SlowDown,
    #[display("TURN_LEFT")]
    TurnLeft,
    #[display("TURN_RIGHT")]
    TurnRight,
}

impl Command {
    pub const ALL: [Self; 4] = [Self::SpeedUp, Self::SlowDown, Self::TurnLeft, Self::TurnRight];

    /// Upper-snake-case name used by the structured format (`SPEED_UP`)
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::SpeedUp => "SPEED_UP",
            Self::SlowDown => "SLOW_DOWN",
            Self::TurnLeft => "TURN_LEFT",
            Self::TurnRight => "TURN_RIGHT",
        }
    }

    /// Space-separated phrase used by the tokenized format (`SPEED UP`)
    #[must_use]
    pub const fn phrase(self) -> &'static str {
        match self {
            Self::SpeedUp => "SPEED UP",
            Self::SlowDown => "SLOW DOWN",
            Self::TurnLeft => "TURN LEFT",
            Self::TurnRight => "TURN RIGHT",
        }
    }

    /// Exact match against the structured names.
    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.wire_name() == name)
    }

    /// Exact match against the four known phrases. Anything else is refused.
    #[must_use]
    pub fn from_phrase(phrase: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.phrase() == phrase)
    }
}

/// Lenient parse for user input: accepts `speed-up`, `SPEED_UP`, `speed up`.
impl FromStr for Command {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .to_ascii_uppercase()
            .replace(['-', '_'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        Self::from_phrase(&normalized).ok_or_else(|| UnknownVariant::new("command", s))
    }
}

/// Non-command outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask for an immediate telemetry snapshot
    GetData,
    /// Keep-alive
    Ping,
    /// Ask for the list of connected users
    ListUsers,
}

/// How a telemetry event reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryOrigin {
    /// Pushed by the service on its own schedule
    Periodic,
    /// Reply to a [`Request::GetData`]
    OnDemand,
}

impl TelemetryOrigin {
    /// Discriminator the event arrived with; also the origin column in logs.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Periodic => "TELEMETRY",
            Self::OnDemand => "DATA",
        }
    }
}

/// Vehicle status sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub speed: i64,
    pub battery: i64,
    pub temp: i64,
    pub dir: String,
    /// Unix seconds
    pub ts: i64,
    pub origin: TelemetryOrigin,
}

/// Builds a telemetry event field by field, substituting defaults for
/// anything that was missing or unparseable.
#[derive(Debug, Default)]
pub(crate) struct TelemetryFields {
    pub speed: Option<i64>,
    pub battery: Option<i64>,
    pub temp: Option<i64>,
    pub dir: Option<String>,
    pub ts: Option<i64>,
}

impl TelemetryFields {
    pub fn finish(self, origin: TelemetryOrigin) -> Telemetry {
        Telemetry {
            speed: self.speed.unwrap_or(0),
            battery: self.battery.unwrap_or(0),
            temp: self.temp.unwrap_or(0),
            dir: self
                .dir
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_DIR.to_string()),
            ts: self.ts.unwrap_or_else(unix_now),
            origin,
        }
    }
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Telemetry(Telemetry),
    Ack { name: String },
    Nack { name: String, reason: String },
    Error { code: String },
    HandshakeResult { role: String },
    /// Telemetry subscription confirmed. Completes an observer handshake,
    /// while admins still wait for their authentication reply.
    Subscribed,
    UserList { count: u32 },
    UserEntry { raw: String },
    /// Reply to [`Request::Ping`]
    Pong,
    /// Anything unrecognized. Never fatal.
    Unknown { raw: String },
}

impl Event {
    pub(crate) fn unknown(line: &str) -> Self {
        Self::Unknown {
            raw: line.to_string(),
        }
    }
}

/// Result of feeding an inbound event to the handshake tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Not a handshake reply, or an intermediate one
    Pending,
    /// Handshake complete with the given role
    Granted(String),
    /// Peer refused the session
    Rejected(String),
}

/// Wire format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON lines
    #[default]
    #[display("structured")]
    Structured,
    /// `TLP/1.0` verb lines
    #[display("tokenized")]
    Tokenized,
}

impl WireFormat {
    #[must_use]
    pub fn codec(self) -> Box<dyn ProtocolCodec> {
        match self {
            Self::Structured => Box::new(StructuredCodec),
            Self::Tokenized => Box::new(TokenizedCodec),
        }
    }
}

impl FromStr for WireFormat {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(Self::Structured),
            "tokenized" | "text" | "tlp" => Ok(Self::Tokenized),
            _ => Err(UnknownVariant::new("wire format", s)),
        }
    }
}

/// Encode/decode between wire lines and typed messages.
///
/// Every encoded message is a complete line including the trailing `\n`.
/// `decode` receives a single line with the delimiter already stripped.
pub trait ProtocolCodec: Send + Sync {
    fn wire_format(&self) -> WireFormat;

    /// Lines sent right after connecting, in order.
    ///
    /// The token is only included for [`Role::Admin`].
    fn handshake(&self, role: Role, token: Option<&str>) -> Vec<Vec<u8>>;

    fn decode(&self, line: &str) -> Event;

    fn encode_command(&self, command: Command) -> Vec<u8>;

    /// Parse an encoded command line back. Refuses unknown command names.
    fn decode_command(&self, line: &str) -> Option<Command>;

    /// `None` when this format has no equivalent for the request.
    fn encode_request(&self, request: Request) -> Option<Vec<u8>>;

    /// Decide whether `event` completes the handshake for `requested`.
    fn handshake_step(&self, requested: Role, event: &Event) -> HandshakeStep {
        match event {
            Event::HandshakeResult { role } if requested.matches(role) => {
                HandshakeStep::Granted(requested.wire_name().to_string())
            }
            Event::HandshakeResult { role } => {
                HandshakeStep::Rejected(format!("granted role {role:?}, wanted {requested}"))
            }
            Event::Error { code } => HandshakeStep::Rejected(code.clone()),
            Event::Nack { name, reason } => HandshakeStep::Rejected(format!("{name}: {reason}")),
            _ => HandshakeStep::Pending,
        }
    }
}

/// Whether `token` fits in a single handshake field: non-empty, with no
/// whitespace or control characters that could split or extend the line.
#[must_use]
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Current wall-clock time as Unix seconds (0 if the clock is before 1970)
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

pub(crate) fn line(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.push(b'\n');
    bytes
}
