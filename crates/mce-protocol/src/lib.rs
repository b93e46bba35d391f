use serde::{Deserialize, Serialize};

/// Identity of a remote device.
pub type PeerId = String;

/// Opaque message handle assigned by the peer.
pub type Handle = String;

/// Maximum length of one JSON line on the notification link.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Target identifier an inbound notification connection must declare.
pub const MNS_TARGET: &str = "bb582b41-420c-11db-b0de-0800200c9a66";

/// Content type header carried by event-report deliveries.
pub const EVENT_REPORT_TYPE: &str = "x-bt/MAP-event-report";

/// Well-known folder names on the peer's message store.
pub mod folders {
    pub const ROOT: &str = "";
    pub const TELECOM: &str = "telecom";
    pub const MSG: &str = "msg";
    pub const INBOX: &str = "inbox";
    pub const OUTBOX: &str = "outbox";
}

/// Bearer a message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bearer {
    SmsCdma,
    SmsGsm,
    Mms,
    Email,
}

/// Read state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
}

/// Who a message came from, as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Originator {
    pub name: Option<String>,
    pub number: String,
}

/// Immutable description of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub bearer: Bearer,
    pub status: MessageStatus,
    pub originator: Option<Originator>,
    /// Phone numbers or URIs, in delivery order.
    pub recipients: Vec<String>,
    pub body: String,
    /// Folder the message lives in on the peer.
    pub folder: String,
}

/// Supported-message-type bits advertised in the peer's service record.
pub const MSG_TYPE_EMAIL: u8 = 0x01;
pub const MSG_TYPE_SMS_GSM: u8 = 0x02;
pub const MSG_TYPE_SMS_CDMA: u8 = 0x04;
pub const MSG_TYPE_MMS: u8 = 0x08;

/// Service-connection descriptor discovered for the peer's message-access
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub channel: u8,
    pub version: u16,
    pub supported_features: u32,
    pub supported_message_types: u8,
}

impl ServiceRecord {
    /// Default bearer for outbound messages. CDMA wins when the record
    /// advertises both CDMA and GSM.
    pub fn default_bearer(&self) -> Bearer {
        if self.supported_message_types & MSG_TYPE_SMS_CDMA != 0 {
            Bearer::SmsCdma
        } else {
            Bearer::SmsGsm
        }
    }
}

/// A peer together with its discovered service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub peer: PeerId,
    pub record: ServiceRecord,
}

/// What an event report announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    DeliverySuccess,
    SendingSuccess,
    DeliveryFailure,
    SendingFailure,
    MessageDeleted,
    MessageShift,
    MemoryFull,
    MemoryAvailable,
}

/// Asynchronous notification pushed by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub kind: EventKind,
    pub handle: Handle,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub msg_type: Option<Bearer>,
}

/// Operations arriving on the inbound notification link, one JSON object
/// per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NotifyRequest {
    Connect {
        target: String,
    },
    SendEvent {
        content_type: String,
        #[serde(default)]
        instance_id: Option<u8>,
        report: serde_json::Value,
    },
    Get,
    SetFolder,
    Abort,
}

/// Reply to a notification-link operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub code: ResponseCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Ok,
    BadRequest,
    NotAcceptable,
    NotImplemented,
    ServiceUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(types: u8) -> ServiceRecord {
        ServiceRecord {
            channel: 4,
            version: 0x0102,
            supported_features: 0x1f,
            supported_message_types: types,
        }
    }

    #[test]
    fn cdma_preferred_over_gsm() {
        let rec = record(MSG_TYPE_SMS_CDMA | MSG_TYPE_SMS_GSM);
        assert_eq!(rec.default_bearer(), Bearer::SmsCdma);
    }

    #[test]
    fn gsm_when_cdma_absent() {
        let rec = record(MSG_TYPE_SMS_GSM | MSG_TYPE_MMS);
        assert_eq!(rec.default_bearer(), Bearer::SmsGsm);
    }

    #[test]
    fn notify_connect_parses() {
        let line = r#"{"op":"connect","target":"bb582b41-420c-11db-b0de-0800200c9a66"}"#;
        let req: NotifyRequest = serde_json::from_str(line).unwrap();
        match req {
            NotifyRequest::Connect { target } => assert_eq!(target, MNS_TARGET),
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[test]
    fn send_event_instance_id_is_optional_on_the_wire() {
        let line = r#"{"op":"send_event","content_type":"x-bt/MAP-event-report","report":{}}"#;
        let req: NotifyRequest = serde_json::from_str(line).unwrap();
        match req {
            NotifyRequest::SendEvent { instance_id, .. } => assert!(instance_id.is_none()),
            other => panic!("expected send_event, got {other:?}"),
        }
    }

    #[test]
    fn event_report_round_trips() {
        let report = EventReport {
            kind: EventKind::NewMessage,
            handle: "0123".to_string(),
            folder: Some("telecom/msg/inbox".to_string()),
            msg_type: Some(Bearer::SmsGsm),
        };
        let line = serde_json::to_string(&report).unwrap();
        assert!(line.contains(r#""kind":"new_message""#));
        let back: EventReport = serde_json::from_str(&line).unwrap();
        assert_eq!(back, report);
    }
}
