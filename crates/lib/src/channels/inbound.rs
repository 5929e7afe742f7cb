//! Inbound message from a modem, and the complete message handed to storage and dispatch.

use chrono::{DateTime, Local, SecondsFormat};

/// Concatenation header of one fragment of a multi-part SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatHeader {
    pub reference: u16,
    pub total_parts: u8,
    pub part_number: u8,
}

/// A message as received by a modem; possibly one fragment of a concatenated SMS.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: String,
    pub received_at: DateTime<Local>,
    pub text: String,
    /// Name of the modem channel it arrived on.
    pub source_channel: String,
    pub concat: Option<ConcatHeader>,
}

impl InboundMessage {
    pub fn new(
        source_channel: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            received_at: Local::now(),
            text: text.into(),
            source_channel: source_channel.into(),
            concat: None,
        }
    }

    pub fn with_concat(mut self, reference: u16, total_parts: u8, part_number: u8) -> Self {
        self.concat = Some(ConcatHeader {
            reference,
            total_parts,
            part_number,
        });
        self
    }
}

/// How a complete message was assembled from fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartInfo {
    pub reference: u16,
    /// Part number of a lone fragment, or the number of parts merged.
    pub part: u8,
    pub total: u8,
    /// True when the text holds fewer than `total` parts.
    pub partial: bool,
}

/// A complete inbound message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub sender: String,
    pub received_at: DateTime<Local>,
    pub text: String,
    pub source_channel: String,
    pub multipart: Option<MultipartInfo>,
}

impl CompleteMessage {
    /// A message that carried no concatenation header.
    pub fn single(msg: InboundMessage) -> Self {
        Self {
            sender: msg.sender,
            received_at: msg.received_at,
            text: msg.text,
            source_channel: msg.source_channel,
            multipart: None,
        }
    }

    /// One fragment delivered on its own (immediate mode, late or malformed fragment).
    pub fn lone_fragment(msg: InboundMessage, header: ConcatHeader) -> Self {
        let multipart = MultipartInfo {
            reference: header.reference,
            part: header.part_number,
            total: header.total_parts,
            partial: header.total_parts != 1,
        };
        Self {
            multipart: Some(multipart),
            ..Self::single(msg)
        }
    }

    /// Receive time as ISO-8601 with offset (e.g. `2024-07-10T13:28:51+01:00`).
    pub fn timestamp(&self) -> String {
        self.received_at.to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}
