//! JSON-lines wire format
//!
//! Every message is a single JSON object on its own line. The `"t"` field
//! names the message kind:
//!
//! ```text
//! out: {"t":"HELLO","role":"ADMIN","token":"..."}
//! out: {"t":"CMD","name":"SPEED_UP"}
//! out: {"t":"GET_DATA"}
//! in:  {"t":"TELEMETRY","speed":12,"battery":92,"temp":25,"dir":"LEFT","ts":1759525432}
//! in:  {"t":"ACK","name":"SPEED_UP"}
//! ```

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    line, Command, Event, ProtocolCodec, Request, Role, TelemetryFields, TelemetryOrigin,
    WireFormat,
};

/// Outbound records. Field order here is the order on the wire.
#[derive(Serialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
enum Outbound<'a> {
    Hello {
        role: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<&'a str>,
    },
    Cmd {
        name: &'a str,
    },
    GetData,
    Ping,
    ListUsers,
}

impl Outbound<'_> {
    fn to_line(&self) -> Vec<u8> {
        // Only string fields and unit variants: serialization cannot fail
        line(serde_json::to_vec(self).expect("string-only record always serializes"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredCodec;

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_i64)
}

fn parse_object(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

fn decode_telemetry(obj: &Map<String, Value>, origin: TelemetryOrigin) -> Event {
    let fields = TelemetryFields {
        speed: int_field(obj, "speed"),
        battery: int_field(obj, "battery"),
        temp: int_field(obj, "temp"),
        dir: str_field(obj, "dir").map(str::to_string),
        ts: int_field(obj, "ts"),
    };
    Event::Telemetry(fields.finish(origin))
}

impl ProtocolCodec for StructuredCodec {
    fn wire_format(&self) -> WireFormat {
        WireFormat::Structured
    }

    fn handshake(&self, role: Role, token: Option<&str>) -> Vec<Vec<u8>> {
        let token = match role {
            Role::Admin => token,
            Role::Observer => None,
        };
        vec![Outbound::Hello {
            role: role.wire_name(),
            token,
        }
        .to_line()]
    }

    fn decode(&self, line: &str) -> Event {
        let Some(obj) = parse_object(line) else {
            return Event::unknown(line);
        };
        let Some(kind) = str_field(&obj, "t") else {
            return Event::unknown(line);
        };

        match kind {
            "TELEMETRY" => decode_telemetry(&obj, TelemetryOrigin::Periodic),
            "DATA" => decode_telemetry(&obj, TelemetryOrigin::OnDemand),
            "HELLO_OK" => Event::HandshakeResult {
                role: str_field(&obj, "role").unwrap_or_default().to_string(),
            },
            "ACK" => Event::Ack {
                name: str_field(&obj, "name").unwrap_or_default().to_string(),
            },
            "NACK" => Event::Nack {
                name: str_field(&obj, "name").unwrap_or_default().to_string(),
                reason: str_field(&obj, "reason").unwrap_or("?").to_string(),
            },
            "ERR" => Event::Error {
                code: str_field(&obj, "code").unwrap_or("?").to_string(),
            },
            "PONG" => Event::Pong,
            "USERS" => match obj.get("count").and_then(Value::as_u64) {
                Some(count) => Event::UserList {
                    count: u32::try_from(count).unwrap_or(u32::MAX),
                },
                None => Event::unknown(line),
            },
            "USER" => Event::UserEntry {
                raw: str_field(&obj, "entry").unwrap_or(line).to_string(),
            },
            _ => Event::unknown(line),
        }
    }

    fn encode_command(&self, command: Command) -> Vec<u8> {
        Outbound::Cmd {
            name: command.wire_name(),
        }
        .to_line()
    }

    fn decode_command(&self, line: &str) -> Option<Command> {
        let obj = parse_object(line.trim())?;
        if str_field(&obj, "t")? != "CMD" {
            return None;
        }
        Command::from_wire_name(str_field(&obj, "name")?)
    }

    fn encode_request(&self, request: Request) -> Option<Vec<u8>> {
        let record = match request {
            Request::GetData => Outbound::GetData,
            Request::Ping => Outbound::Ping,
            Request::ListUsers => Outbound::ListUsers,
        };
        Some(record.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{unix_now, Telemetry, DEFAULT_DIR};

    fn text(bytes: &[u8]) -> &str {
        std::str::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_admin_handshake() {
        let lines = StructuredCodec.handshake(Role::Admin, Some("SECRETO_2025"));
        assert_eq!(lines.len(), 1);
        assert_eq!(
            text(&lines[0]),
            "{\"t\":\"HELLO\",\"role\":\"ADMIN\",\"token\":\"SECRETO_2025\"}\n"
        );
    }

    #[test]
    fn test_observer_handshake_has_no_token() {
        let lines = StructuredCodec.handshake(Role::Observer, Some("ignored"));
        assert_eq!(text(&lines[0]), "{\"t\":\"HELLO\",\"role\":\"OBSERVER\"}\n");
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            text(&StructuredCodec.encode_command(Command::TurnLeft)),
            "{\"t\":\"CMD\",\"name\":\"TURN_LEFT\"}\n"
        );
    }

    #[test]
    fn test_command_round_trip() {
        for command in Command::ALL {
            let encoded = StructuredCodec.encode_command(command);
            assert_eq!(StructuredCodec.decode_command(text(&encoded)), Some(command));
        }
    }

    #[test]
    fn test_decode_command_refuses_unknown_name() {
        assert_eq!(
            StructuredCodec.decode_command("{\"t\":\"CMD\",\"name\":\"JUMP\"}"),
            None
        );
        assert_eq!(StructuredCodec.decode_command("{\"t\":\"ACK\",\"name\":\"SPEED_UP\"}"), None);
    }

    #[test]
    fn test_requests() {
        let codec = StructuredCodec;
        assert_eq!(
            text(&codec.encode_request(Request::GetData).unwrap()),
            "{\"t\":\"GET_DATA\"}\n"
        );
        assert_eq!(text(&codec.encode_request(Request::Ping).unwrap()), "{\"t\":\"PING\"}\n");
        assert_eq!(
            text(&codec.encode_request(Request::ListUsers).unwrap()),
            "{\"t\":\"LIST_USERS\"}\n"
        );
    }

    #[test]
    fn test_decode_on_demand_telemetry() {
        let event = StructuredCodec.decode(
            r#"{"t":"DATA","speed":5,"battery":50,"temp":20,"dir":"RIGHT","ts":1000}"#,
        );
        assert_eq!(
            event,
            Event::Telemetry(Telemetry {
                speed: 5,
                battery: 50,
                temp: 20,
                dir: "RIGHT".to_string(),
                ts: 1000,
                origin: TelemetryOrigin::OnDemand,
            })
        );
    }

    #[test]
    fn test_decode_periodic_telemetry_with_bad_fields() {
        let before = unix_now();
        let event = StructuredCodec.decode(r#"{"t":"TELEMETRY","speed":"fast","battery":80,"dir":7}"#);
        let Event::Telemetry(t) = event else {
            panic!("expected telemetry, got {event:?}");
        };
        assert_eq!(t.origin, TelemetryOrigin::Periodic);
        assert_eq!(t.speed, 0);
        assert_eq!(t.battery, 80);
        assert_eq!(t.temp, 0);
        assert_eq!(t.dir, DEFAULT_DIR);
        assert!(t.ts >= before);
    }

    #[test]
    fn test_decode_replies() {
        let codec = StructuredCodec;
        assert_eq!(
            codec.decode(r#"{"t":"HELLO_OK","role":"OBSERVER"}"#),
            Event::HandshakeResult {
                role: "OBSERVER".to_string()
            }
        );
        assert_eq!(
            codec.decode(r#"{"t":"ACK","name":"SPEED_UP"}"#),
            Event::Ack {
                name: "SPEED_UP".to_string()
            }
        );
        assert_eq!(
            codec.decode(r#"{"t":"NACK","name":"SPEED_UP","reason":"overheat"}"#),
            Event::Nack {
                name: "SPEED_UP".to_string(),
                reason: "overheat".to_string()
            }
        );
        assert_eq!(
            codec.decode(r#"{"t":"ERR","code":"bad_token"}"#),
            Event::Error {
                code: "bad_token".to_string()
            }
        );
        assert_eq!(codec.decode(r#"{"t":"PONG"}"#), Event::Pong);
        assert_eq!(codec.decode(r#"{"t":"USERS","count":3}"#), Event::UserList { count: 3 });
    }

    #[test]
    fn test_decode_garbage_is_unknown() {
        for raw in [
            "not json",
            "[1,2,3]",
            r#"{"speed":5}"#,
            r#"{"t":"WHATEVER"}"#,
            r#"{"t":"CMD","name":"SPEED_UP"}"#,
            r#"{"t":"USERS","count":-1}"#,
        ] {
            assert_eq!(
                StructuredCodec.decode(raw),
                Event::Unknown {
                    raw: raw.to_string()
                },
                "{raw}"
            );
        }
    }
}
