use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single control-channel message.
///
/// Corresponds to the original `{Type, RemoteConnId, Service, Payload}`
/// record; the discriminant here is carried by the enum variant itself
/// rather than a separate `Type` byte.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// Carries payload bytes for an already-open tunnel.
    Forward {
        remote_conn_id: u32,
        service: u32,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Keep-alive; carries no state.
    Ping,
    /// Asks the Agent to dial `service` and open a transfer connection
    /// tagged with `remote_conn_id`.
    OpenConnection { remote_conn_id: u32, service: u32 },
    /// Either side asking the other to forget a tunnel id.
    CloseConnection { remote_conn_id: u32 },
}

impl ControlMessage {
    /// The tunnel id this message concerns, if any. `Ping` has none.
    pub fn remote_conn_id(&self) -> Option<u32> {
        match self {
            ControlMessage::Forward { remote_conn_id, .. }
            | ControlMessage::OpenConnection { remote_conn_id, .. }
            | ControlMessage::CloseConnection { remote_conn_id } => Some(*remote_conn_id),
            ControlMessage::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        bincode::serialize(self).map_err(ProtoError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        bincode::deserialize(bytes).map_err(ProtoError::Decode)
    }
}

// Custom serde helper matching the corpus's bytes-as-bytes (not seq) convention.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode control message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode control message: {0}")]
    Decode(#[source] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_round_trips() {
        let msg = ControlMessage::Forward {
            remote_conn_id: 42,
            service: 7,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = msg.encode().unwrap();
        let decoded = ControlMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn forward_with_empty_payload_round_trips() {
        let msg = ControlMessage::Forward {
            remote_conn_id: 1,
            service: 0,
            payload: Vec::new(),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn ping_round_trips() {
        let bytes = ControlMessage::Ping.encode().unwrap();
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), ControlMessage::Ping);
    }

    #[test]
    fn open_and_close_round_trip() {
        let open = ControlMessage::OpenConnection {
            remote_conn_id: 9,
            service: 3,
        };
        assert_eq!(ControlMessage::decode(&open.encode().unwrap()).unwrap(), open);

        let close = ControlMessage::CloseConnection { remote_conn_id: 9 };
        assert_eq!(ControlMessage::decode(&close.encode().unwrap()).unwrap(), close);
    }

    #[test]
    fn remote_conn_id_is_none_for_ping() {
        assert_eq!(ControlMessage::Ping.remote_conn_id(), None);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let garbage = [0xff, 0xff, 0xff, 0xff, 0xff];
        assert!(ControlMessage::decode(&garbage).is_err());
    }
}
