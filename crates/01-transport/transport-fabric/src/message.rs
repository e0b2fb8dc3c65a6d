use serde::{Deserialize, Serialize};

/// One message on a worker channel.
///
/// Requests and their replies carry an id; events do not. The close
/// sentinel is not a variant: channels deliver `Option<WireMessage>` and
/// `None` means the remote end is closing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    Request { msg_id: u64, payload: Vec<u8> },
    Response { msg_id: u64, payload: Vec<u8> },
    Failure { msg_id: u64, error: String },
    Event { payload: Vec<u8> },
}

impl WireMessage {
    pub fn msg_id(&self) -> Option<u64> {
        match self {
            WireMessage::Request { msg_id, .. }
            | WireMessage::Response { msg_id, .. }
            | WireMessage::Failure { msg_id, .. } => Some(*msg_id),
            WireMessage::Event { .. } => None,
        }
    }
}
