//! Protocol message types exchanged with the detector server.

use liveness_core::Frame;

/// Sequence number correlating a frame request with its response.
pub type Seq = u64;

/// One-byte type tag that follows every length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    FrameRequest = 0x01,
    FrameResponse = 0x02,
    TextNotification = 0x03,
    AliveNotification = 0x04,
    CapturePrompt = 0x05,
    ControlCommand = 0x06,
}

impl MessageTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::FrameRequest),
            0x02 => Some(Self::FrameResponse),
            0x03 => Some(Self::TextNotification),
            0x04 => Some(Self::AliveNotification),
            0x05 => Some(Self::CapturePrompt),
            0x06 => Some(Self::ControlCommand),
            _ => None,
        }
    }
}

/// Which server-side text a [`WireMessage::ControlCommand`] replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Text drawn over the gesture prompt.
    OverwriteText,
    /// Warning line shown under the prompt.
    WarningText,
}

impl ControlKind {
    pub const fn as_u8(self) -> u8 {
        match self {
            ControlKind::OverwriteText => 0x01,
            ControlKind::WarningText => 0x02,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ControlKind::OverwriteText),
            0x02 => Some(ControlKind::WarningText),
            _ => None,
        }
    }
}

/// Every message that can travel over the detector socket.
///
/// Requests and control commands flow client → server; responses and
/// notifications flow server → client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A frame submitted for processing.
    FrameRequest { seq: Seq, frame: Frame },

    /// The processed frame for request `seq`, if the server produced one.
    FrameResponse { seq: Seq, frame: Option<Frame> },

    /// Free-form status text.
    TextNotification { text: String },

    /// Liveness verdict.
    AliveNotification { alive: bool },

    /// The server wants the application to capture the current frame.
    CapturePrompt { take_picture: bool },

    /// One-way setter; the server never answers it.
    ControlCommand { kind: ControlKind, text: String },
}

impl WireMessage {
    pub fn frame_request(seq: Seq, frame: Frame) -> Self {
        Self::FrameRequest { seq, frame }
    }

    pub fn frame_response(seq: Seq, frame: Option<Frame>) -> Self {
        Self::FrameResponse { seq, frame }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::TextNotification { text: text.into() }
    }

    pub fn alive(alive: bool) -> Self {
        Self::AliveNotification { alive }
    }

    pub fn capture_prompt(take_picture: bool) -> Self {
        Self::CapturePrompt { take_picture }
    }

    pub fn overwrite_text(text: impl Into<String>) -> Self {
        Self::ControlCommand {
            kind: ControlKind::OverwriteText,
            text: text.into(),
        }
    }

    pub fn warning_text(text: impl Into<String>) -> Self {
        Self::ControlCommand {
            kind: ControlKind::WarningText,
            text: text.into(),
        }
    }

    pub fn tag(&self) -> MessageTag {
        match self {
            Self::FrameRequest { .. } => MessageTag::FrameRequest,
            Self::FrameResponse { .. } => MessageTag::FrameResponse,
            Self::TextNotification { .. } => MessageTag::TextNotification,
            Self::AliveNotification { .. } => MessageTag::AliveNotification,
            Self::CapturePrompt { .. } => MessageTag::CapturePrompt,
            Self::ControlCommand { .. } => MessageTag::ControlCommand,
        }
    }

    /// Encoded size of tag plus payload, the value carried in the length prefix.
    pub fn body_len(&self) -> usize {
        let payload = match self {
            Self::FrameRequest { frame, .. } => 8 + frame.encoded_len(),
            Self::FrameResponse { frame, .. } => 8 + 1 + frame.as_ref().map_or(0, Frame::encoded_len),
            Self::TextNotification { text } => text.len(),
            Self::AliveNotification { .. } | Self::CapturePrompt { .. } => 1,
            Self::ControlCommand { text, .. } => 1 + text.len(),
        };
        1 + payload
    }

    /// True for unsolicited server → client messages.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            Self::TextNotification { .. } | Self::AliveNotification { .. } | Self::CapturePrompt { .. }
        )
    }
}
