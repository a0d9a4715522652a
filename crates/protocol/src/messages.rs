//! Message envelope and payload definitions.
//!
//! Every message on the broker channel is an [`Envelope`]: an opcode, two
//! small integer arguments and a typed [`Payload`]. Blocking calls set a
//! `correlation` id; the matching reply carries it back in `in_reply_to`.
//! File descriptors never travel inside the envelope itself. The sender
//! announces how many accompany the message in `attached_fds` and the
//! transport carries them out of band.

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identity reported for a tracked process that did not name itself.
pub const INVALID_IDENTITY: &str = "<INVALID>";

/// Envelope wrapper for all broker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Set by a caller that waits for an answer.
    pub correlation: Option<u64>,
    /// Correlation id of the request this message answers.
    pub in_reply_to: Option<u64>,
    /// What the message means.
    pub opcode: Opcode,
    pub arg1: i32,
    pub arg2: i32,
    /// Number of descriptors that accompany this message on the transport.
    pub attached_fds: u8,
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope with empty arguments and payload.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation: None,
            in_reply_to: None,
            opcode,
            arg1: 0,
            arg2: 0,
            attached_fds: 0,
            payload: Payload::Empty,
        }
    }

    pub fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// True when the sender is blocked waiting for an answer.
    pub fn expects_reply(&self) -> bool {
        self.correlation.is_some()
    }

    /// True when this message answers an earlier call.
    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }

    /// Interpret `arg1` as a boolean answer.
    pub fn flag(&self) -> bool {
        self.arg1 != 0
    }

    /// Serialize the envelope to MessagePack bytes.
    ///
    /// Structs are written as maps so that unit payload variants keep
    /// their adjacent tag readable.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[default]
    Empty,
    /// Description of a process asking to be tracked.
    Registration(Registration),
    /// Session addressed by a request, optionally with a size.
    SessionRequest(SessionRequest),
    /// A single session description.
    Session(SessionSummary),
    /// The full session list.
    Sessions(Vec<SessionSummary>),
    /// Why a request could not be served.
    Failure(Failure),
}

/// Registration record sent with `REGISTER_TRACKED_PROCESS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub identity: String,
    pub pid: i32,
    pub pid_as_string: String,
    pub label: String,
    pub description: String,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            identity: INVALID_IDENTITY.to_string(),
            pid: -1,
            pid_as_string: "-1".to_string(),
            label: String::new(),
            description: String::new(),
        }
    }
}

impl Registration {
    /// Build a registration for `pid`, filling `pid_as_string` from it.
    pub fn new(identity: impl Into<String>, pid: i32) -> Self {
        Self {
            identity: identity.into(),
            pid,
            pid_as_string: pid.to_string(),
            ..Default::default()
        }
    }

    /// A registration is usable only with a real identity and a positive pid.
    pub fn is_valid(&self) -> bool {
        self.pid > 0 && !self.identity.is_empty() && self.identity != INVALID_IDENTITY
    }
}

/// Session addressed by attach/remove requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionRequest {
    pub session_id: u64,
    /// Size to spawn or resize with; zero means "leave as is".
    pub cols: u16,
    pub rows: u16,
}

/// Kind of a hosted session, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKindTag {
    Shell,
    Log,
    Logcat,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u64,
    pub kind: SessionKindTag,
    pub name: String,
    pub pid: u32,
    pub running: bool,
    /// Meaningful only when `running` is false.
    pub exit_status: i32,
    /// Identity of the tracked process the session belongs to, if any.
    pub tracked_identity: Option<String>,
}

/// Failure description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,
}

impl Failure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_defaults() {
        let env = Envelope::new(Opcode::START_TERMINAL);
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert_eq!(env.payload, Payload::Empty);
        assert!(!env.expects_reply());
        assert!(!env.is_reply());
        assert_eq!(env.attached_fds, 0);
    }

    #[test]
    fn test_envelope_msgpack_with_registration() {
        let mut env = Envelope::new(Opcode::REGISTER_TRACKED_PROCESS)
            .with_payload(Payload::Registration(Registration::new("demo", 4321)));
        env.correlation = Some(17);
        env.attached_fds = 2;

        let bytes = env.to_msgpack().expect("serialization failed");
        let decoded = Envelope::from_msgpack(&bytes).expect("deserialization failed");
        assert_eq!(decoded, env);
        assert!(decoded.expects_reply());
    }

    #[test]
    fn test_envelope_msgpack_with_session_list() {
        let summary = SessionSummary {
            id: 3,
            kind: SessionKindTag::Logcat,
            name: "logcat -C --pid=4321 [CONNECTED: demo]".to_string(),
            pid: 99,
            running: true,
            exit_status: 0,
            tracked_identity: Some("demo".to_string()),
        };
        let mut env =
            Envelope::new(Opcode::SESSION_LIST).with_payload(Payload::Sessions(vec![summary]));
        env.in_reply_to = Some(5);

        let bytes = env.to_msgpack().unwrap();
        let decoded = Envelope::from_msgpack(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert!(decoded.is_reply());
    }

    #[test]
    fn test_envelope_msgpack_empty_payload() {
        let env = Envelope::new(Opcode::CALLBACK_INVOKED);
        let bytes = env.to_msgpack().unwrap();
        assert_eq!(Envelope::from_msgpack(&bytes).unwrap(), env);
    }

    #[test]
    fn test_registration_defaults_are_invalid() {
        let reg = Registration::default();
        assert_eq!(reg.identity, INVALID_IDENTITY);
        assert_eq!(reg.pid, -1);
        assert!(!reg.is_valid());
    }

    #[test]
    fn test_registration_validity() {
        assert!(Registration::new("app", 10).is_valid());
        assert!(!Registration::new("app", 0).is_valid());
        assert!(!Registration::new("", 10).is_valid());
        assert_eq!(Registration::new("app", 10).pid_as_string, "10");
    }

    #[test]
    fn test_flag_helper() {
        let env = Envelope::new(Opcode::ARE_SESSIONS_EMPTY).with_args(1, 0);
        assert!(env.flag());
        let env = Envelope::new(Opcode::ARE_SESSIONS_EMPTY);
        assert!(!env.flag());
    }

    #[test]
    fn test_payload_json_shape() {
        let json = serde_json::to_value(Payload::Failure(Failure::new("nope"))).unwrap();
        assert_eq!(json["type"], "Failure");
        assert_eq!(json["data"]["reason"], "nope");
    }
}
