//! `TLP/1.0` verb-first wire format
//!
//! ```text
//! out: HELLO TLP/1.0
//! out: SUBSCRIBE
//! out: AUTH ADMIN <token>
//! out: COMMAND SPEED UP
//! out: LIST USERS
//! in:  OK ...
//! in:  ERROR ...
//! in:  TELEMETRY speed=<int> battery=<int> temp=<int> dir=<string> ts=<int>
//! in:  USERS <int>
//! in:  USER <free-text>
//! ```
//!
//! Telemetry is push-only; there is no on-demand data request.

use crate::{
    line, Command, Event, HandshakeStep, ProtocolCodec, Request, Role, TelemetryFields,
    TelemetryOrigin, WireFormat,
};

pub const PROTOCOL_VERSION: &str = "TLP/1.0";

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizedCodec;

fn text_line(text: &str) -> Vec<u8> {
    line(text.as_bytes().to_vec())
}

fn decode_telemetry(pairs: &str) -> Event {
    let mut fields = TelemetryFields::default();
    for pair in pairs.split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "speed" => fields.speed = value.parse().ok(),
            "battery" => fields.battery = value.parse().ok(),
            "temp" => fields.temp = value.parse().ok(),
            "dir" => fields.dir = Some(value.to_string()),
            "ts" => fields.ts = value.parse().ok(),
            _ => {}
        }
    }
    Event::Telemetry(fields.finish(TelemetryOrigin::Periodic))
}

impl ProtocolCodec for TokenizedCodec {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Tokenized
    }

    fn handshake(&self, role: Role, token: Option<&str>) -> Vec<Vec<u8>> {
        let mut lines = vec![
            text_line(&format!("HELLO {PROTOCOL_VERSION}")),
            text_line("SUBSCRIBE"),
        ];
        if let (Role::Admin, Some(token)) = (role, token) {
            lines.push(text_line(&format!("AUTH ADMIN {token}")));
        }
        lines
    }

    fn decode(&self, line: &str) -> Event {
        let trimmed = line.trim();
        let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let rest = rest.trim();

        match verb {
            "TELEMETRY" => decode_telemetry(rest),
            "OK" => match rest {
                "AUTH ADMIN" => Event::HandshakeResult {
                    role: Role::Admin.wire_name().to_string(),
                },
                "SUBSCRIBED" => Event::Subscribed,
                _ => Event::Ack {
                    name: rest.to_string(),
                },
            },
            "ERROR" => Event::Error {
                code: if rest.is_empty() { "?" } else { rest }.to_string(),
            },
            "USERS" => match rest.parse() {
                Ok(count) => Event::UserList { count },
                Err(_) => Event::unknown(line),
            },
            "USER" => Event::UserEntry {
                raw: rest.to_string(),
            },
            _ => Event::unknown(line),
        }
    }

    fn encode_command(&self, command: Command) -> Vec<u8> {
        text_line(&format!("COMMAND {}", command.phrase()))
    }

    fn decode_command(&self, line: &str) -> Option<Command> {
        let phrase = line.trim().strip_prefix("COMMAND ")?;
        Command::from_phrase(phrase)
    }

    fn encode_request(&self, request: Request) -> Option<Vec<u8>> {
        match request {
            Request::ListUsers => Some(text_line("LIST USERS")),
            Request::GetData | Request::Ping => None,
        }
    }

    fn handshake_step(&self, requested: Role, event: &Event) -> HandshakeStep {
        match event {
            // SUBSCRIBED arrives before AUTH ADMIN; it is not the final answer for admins
            Event::Subscribed => match requested {
                Role::Observer => HandshakeStep::Granted(Role::Observer.wire_name().to_string()),
                Role::Admin => HandshakeStep::Pending,
            },
            Event::HandshakeResult { role } if requested.matches(role) => {
                HandshakeStep::Granted(requested.wire_name().to_string())
            }
            Event::HandshakeResult { role } => {
                HandshakeStep::Rejected(format!("granted role {role:?}, wanted {requested}"))
            }
            Event::Error { code } => HandshakeStep::Rejected(code.clone()),
            _ => HandshakeStep::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{unix_now, Telemetry, DEFAULT_DIR};

    fn lines(encoded: &[Vec<u8>]) -> Vec<String> {
        encoded
            .iter()
            .map(|l| String::from_utf8(l.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_admin_handshake() {
        let hs = TokenizedCodec.handshake(Role::Admin, Some("SECRETO_2025"));
        assert_eq!(
            lines(&hs),
            ["HELLO TLP/1.0\n", "SUBSCRIBE\n", "AUTH ADMIN SECRETO_2025\n"]
        );
    }

    #[test]
    fn test_observer_handshake() {
        let hs = TokenizedCodec.handshake(Role::Observer, Some("unused"));
        assert_eq!(lines(&hs), ["HELLO TLP/1.0\n", "SUBSCRIBE\n"]);
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            TokenizedCodec.encode_command(Command::SpeedUp),
            b"COMMAND SPEED UP\n".to_vec()
        );
        for command in Command::ALL {
            let encoded = TokenizedCodec.encode_command(command);
            let text = std::str::from_utf8(&encoded).unwrap();
            assert_eq!(TokenizedCodec.decode_command(text), Some(command));
        }
    }

    #[test]
    fn test_decode_command_refuses_unknown_phrase() {
        assert_eq!(TokenizedCodec.decode_command("COMMAND JUMP"), None);
        assert_eq!(TokenizedCodec.decode_command("COMMAND speed up"), None);
        assert_eq!(TokenizedCodec.decode_command("COMMAND SPEED_UP"), None);
        assert_eq!(TokenizedCodec.decode_command("SPEED UP"), None);
    }

    #[test]
    fn test_requests() {
        assert_eq!(
            TokenizedCodec.encode_request(Request::ListUsers),
            Some(b"LIST USERS\n".to_vec())
        );
        assert_eq!(TokenizedCodec.encode_request(Request::GetData), None);
        assert_eq!(TokenizedCodec.encode_request(Request::Ping), None);
    }

    #[test]
    fn test_decode_telemetry() {
        let event =
            TokenizedCodec.decode("TELEMETRY speed=12 battery=92 temp=25 dir=LEFT ts=1759525432");
        assert_eq!(
            event,
            Event::Telemetry(Telemetry {
                speed: 12,
                battery: 92,
                temp: 25,
                dir: "LEFT".to_string(),
                ts: 1_759_525_432,
                origin: TelemetryOrigin::Periodic,
            })
        );
    }

    #[test]
    fn test_decode_telemetry_malformed_fields() {
        let before = unix_now();
        let event = TokenizedCodec.decode("TELEMETRY speed=abc battery=40 junk ts=soon extra=1");
        let Event::Telemetry(t) = event else {
            panic!("expected telemetry, got {event:?}");
        };
        assert_eq!(t.speed, 0);
        assert_eq!(t.battery, 40);
        assert_eq!(t.temp, 0);
        assert_eq!(t.dir, DEFAULT_DIR);
        assert!(t.ts >= before && t.ts <= unix_now());

        let Event::Telemetry(empty) = TokenizedCodec.decode("TELEMETRY") else {
            panic!("bare TELEMETRY should still be telemetry");
        };
        assert_eq!((empty.speed, empty.battery, empty.temp), (0, 0, 0));
        assert_eq!(empty.dir, DEFAULT_DIR);
    }

    #[test]
    fn test_decode_status_lines() {
        let codec = TokenizedCodec;
        assert_eq!(
            codec.decode("OK AUTH ADMIN"),
            Event::HandshakeResult {
                role: "ADMIN".to_string()
            }
        );
        assert_eq!(codec.decode("OK SUBSCRIBED"), Event::Subscribed);
        assert_eq!(
            codec.decode("OK EXECUTED"),
            Event::Ack {
                name: "EXECUTED".to_string()
            }
        );
        assert_eq!(
            codec.decode("ERROR REJECTED overheat"),
            Event::Error {
                code: "REJECTED overheat".to_string()
            }
        );
        assert_eq!(codec.decode("USERS 2"), Event::UserList { count: 2 });
        assert_eq!(
            codec.decode("USER 127.0.0.1:5555 ADMIN 1759525432"),
            Event::UserEntry {
                raw: "127.0.0.1:5555 ADMIN 1759525432".to_string()
            }
        );
        assert_eq!(
            codec.decode("USERS many"),
            Event::Unknown {
                raw: "USERS many".to_string()
            }
        );
        assert_eq!(
            codec.decode("telemetry speed=1"),
            Event::Unknown {
                raw: "telemetry speed=1".to_string()
            }
        );
    }

    #[test]
    fn test_admin_handshake_waits_for_auth() {
        let codec = TokenizedCodec;
        let subscribed = codec.decode("OK SUBSCRIBED");
        let auth = codec.decode("OK AUTH ADMIN");
        let welcome = codec.decode("OK Welcome to TLP/1.0");

        assert_eq!(codec.handshake_step(Role::Admin, &welcome), HandshakeStep::Pending);
        assert_eq!(codec.handshake_step(Role::Admin, &subscribed), HandshakeStep::Pending);
        assert_eq!(
            codec.handshake_step(Role::Admin, &auth),
            HandshakeStep::Granted("ADMIN".to_string())
        );
        assert_eq!(
            codec.handshake_step(Role::Observer, &subscribed),
            HandshakeStep::Granted("OBSERVER".to_string())
        );
        assert_eq!(
            codec.handshake_step(Role::Admin, &codec.decode("ERROR AUTH bad_token")),
            HandshakeStep::Rejected("AUTH bad_token".to_string())
        );
    }
}
