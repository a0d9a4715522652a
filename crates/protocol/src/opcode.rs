//! Opcode catalog shared by the broker and its clients.
//!
//! Opcodes are plain `u32` values on the wire. The numbering is stable:
//! existing values must never be reassigned.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An RPC opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(pub u32);

impl Opcode {
    pub const REGISTER_CLIENT: Opcode = Opcode(1);
    pub const REGISTERED_CLIENT: Opcode = Opcode(2);
    pub const UNREGISTER_CLIENT: Opcode = Opcode(3);
    pub const UNREGISTERED_CLIENT: Opcode = Opcode(4);
    pub const REGISTER_TRACKED_PROCESS: Opcode = Opcode(5);
    pub const REGISTERED_TRACKED_PROCESS: Opcode = Opcode(6);
    pub const REGISTER_TRACKED_PROCESS_FAILED: Opcode = Opcode(7);
    pub const START_TERMINAL: Opcode = Opcode(8);
    pub const STARTED_TERMINAL: Opcode = Opcode(9);

    pub const CREATE_SHELL_SESSION: Opcode = Opcode(10);
    pub const CREATE_LOGCAT_SESSION: Opcode = Opcode(11);
    pub const CREATE_LOG_SESSION: Opcode = Opcode(12);
    pub const SESSION_CREATED: Opcode = Opcode(13);
    pub const ATTACH_SESSION: Opcode = Opcode(14);
    pub const SESSION_ATTACHED: Opcode = Opcode(15);
    pub const REMOVE_SESSION: Opcode = Opcode(16);
    pub const SESSION_REMOVED: Opcode = Opcode(17);
    pub const SESSION_REQUEST_FAILED: Opcode = Opcode(18);
    pub const LIST_SESSIONS: Opcode = Opcode(19);
    pub const SESSION_LIST: Opcode = Opcode(20);
    pub const SESSIONS_CHANGED: Opcode = Opcode(21);

    pub const TERMINATE: Opcode = Opcode(30);
    pub const TERMINATING: Opcode = Opcode(31);

    /// Generic acknowledgement sent when a handler produced no reply of its own.
    pub const CALLBACK_INVOKED: Opcode = Opcode(100);
    /// Explicit "nothing to say" reply that still releases a blocked caller.
    pub const NO_REPLY: Opcode = Opcode(999);

    pub const IS_SERVER_ALIVE: Opcode = Opcode(1300);
    pub const ARE_SESSIONS_EMPTY: Opcode = Opcode(1301);
    pub const DOES_SERVER_WANT_TO_STOP: Opcode = Opcode(1302);

    /// Reply from the default handler for opcodes nobody registered.
    pub const DEFAULT_CODE: Opcode = Opcode(9999);

    /// Raw numeric value.
    #[inline]
    pub fn code(self) -> u32 {
        self.0
    }

    /// Symbolic name, if the opcode is part of the catalog.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::REGISTER_CLIENT => "REGISTER_CLIENT",
            Self::REGISTERED_CLIENT => "REGISTERED_CLIENT",
            Self::UNREGISTER_CLIENT => "UNREGISTER_CLIENT",
            Self::UNREGISTERED_CLIENT => "UNREGISTERED_CLIENT",
            Self::REGISTER_TRACKED_PROCESS => "REGISTER_TRACKED_PROCESS",
            Self::REGISTERED_TRACKED_PROCESS => "REGISTERED_TRACKED_PROCESS",
            Self::REGISTER_TRACKED_PROCESS_FAILED => "REGISTER_TRACKED_PROCESS_FAILED",
            Self::START_TERMINAL => "START_TERMINAL",
            Self::STARTED_TERMINAL => "STARTED_TERMINAL",
            Self::CREATE_SHELL_SESSION => "CREATE_SHELL_SESSION",
            Self::CREATE_LOGCAT_SESSION => "CREATE_LOGCAT_SESSION",
            Self::CREATE_LOG_SESSION => "CREATE_LOG_SESSION",
            Self::SESSION_CREATED => "SESSION_CREATED",
            Self::ATTACH_SESSION => "ATTACH_SESSION",
            Self::SESSION_ATTACHED => "SESSION_ATTACHED",
            Self::REMOVE_SESSION => "REMOVE_SESSION",
            Self::SESSION_REMOVED => "SESSION_REMOVED",
            Self::SESSION_REQUEST_FAILED => "SESSION_REQUEST_FAILED",
            Self::LIST_SESSIONS => "LIST_SESSIONS",
            Self::SESSION_LIST => "SESSION_LIST",
            Self::SESSIONS_CHANGED => "SESSIONS_CHANGED",
            Self::TERMINATE => "TERMINATE",
            Self::TERMINATING => "TERMINATING",
            Self::CALLBACK_INVOKED => "CALLBACK_INVOKED",
            Self::NO_REPLY => "NO_REPLY",
            Self::IS_SERVER_ALIVE => "IS_SERVER_ALIVE",
            Self::ARE_SESSIONS_EMPTY => "ARE_SESSIONS_EMPTY",
            Self::DOES_SERVER_WANT_TO_STOP => "DOES_SERVER_WANT_TO_STOP",
            Self::DEFAULT_CODE => "DEFAULT_CODE",
            _ => return None,
        };
        Some(name)
    }

    /// Whether this opcode is one of the generic acknowledgements.
    pub fn is_ack(self) -> bool {
        matches!(
            self,
            Self::CALLBACK_INVOKED | Self::NO_REPLY | Self::DEFAULT_CODE
        )
    }
}

impl From<u32> for Opcode {
    fn from(code: u32) -> Self {
        Opcode(code)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "OPCODE({})", self.0),
        }
    }
}
