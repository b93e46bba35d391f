use mce_protocol::{Bearer, Handle, MessageEnvelope};
use uuid::Uuid;

/// Character set requested for message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Native,
    Utf8,
}

/// Parameters for a messages listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingParams {
    pub offset: u16,
    pub max_count: u16,
    pub unread_only: bool,
}

impl Default for ListingParams {
    fn default() -> Self {
        Self {
            offset: 0,
            max_count: 1024,
            unread_only: true,
        }
    }
}

/// One unit of work executed against the open session. The value is
/// immutable and travels back unchanged in the completion event, where it
/// serves as the correlation key for its [`RequestOutcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SetFolder {
        path: String,
    },
    GetFolderListing {
        offset: u16,
        count: u16,
    },
    SetNotificationRegistration {
        enable: bool,
    },
    PushMessage {
        folder: String,
        envelope: MessageEnvelope,
        /// Correlation id for the send/delivery receipt tables.
        envelope_id: Uuid,
        charset: Charset,
        attachment: bool,
        final_flag: bool,
    },
    GetMessage {
        handle: Handle,
        charset: Charset,
        attachment: bool,
    },
    GetMessagesListing {
        folder: String,
        params: ListingParams,
    },
}

impl Request {
    /// Retrieve one message body, UTF-8, no attachments.
    pub fn get_message(handle: Handle) -> Request {
        Request::GetMessage {
            handle,
            charset: Charset::Utf8,
            attachment: false,
        }
    }

    /// Push a message to the given folder. SMS bearers go out in native
    /// charset, everything else as UTF-8.
    pub fn push_message(folder: String, envelope: MessageEnvelope, envelope_id: Uuid) -> Request {
        let charset = match envelope.bearer {
            Bearer::SmsCdma | Bearer::SmsGsm => Charset::Native,
            Bearer::Mms | Bearer::Email => Charset::Utf8,
        };
        Request::PushMessage {
            folder,
            envelope,
            envelope_id,
            charset,
            attachment: false,
            final_flag: true,
        }
    }
}

/// Typed result of a successfully executed [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Nothing beyond success (set-folder, notification registration).
    Done,
    /// Handle the peer assigned to a pushed message.
    Pushed { handle: Handle },
    /// Number of subfolders reported by a folder listing.
    FolderListing { count: u16 },
    /// A retrieved message.
    Message { envelope: MessageEnvelope },
    /// Handles returned by a messages listing.
    Listing { handles: Vec<Handle> },
}
