use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Default render width for image messages that do not carry one.
pub const DEFAULT_IMAGE_WIDTH: u32 = 400;

/// Number of screen regions a message can be placed in (3x3 grid).
pub const ZONE_COUNT: u8 = 9;

/// Drop seconds and sub-seconds; agenda times are kept at minute precision.
pub fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// One scheduled delivery of a message, as held by the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaEntry {
    pub message_id: i64,
    /// Local wall-clock time, minute precision.
    pub scheduled_at: NaiveDateTime,
    pub shown: bool,
}

impl AgendaEntry {
    /// True when the entry is unshown and falls in the same minute as `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        !self.shown && truncate_to_minute(self.scheduled_at) == truncate_to_minute(now)
    }
}

/// Raw `(message_id, scheduled_at)` assignment fetched for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleTuple {
    pub message_id: i64,
    pub scheduled_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    Image,
    Text,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Image => "image",
            MessageKind::Text => "text",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unsupported message kind: {0}")]
    UnsupportedKind(String),
    #[error("malformed message payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Base64-encoded image and its render width.
    Image { image: String, width: u32 },
    Text { title: String, text: String },
}

/// A cached message body parsed into its typed variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub zone: u8,
    pub duration_seconds: u32,
    pub link: Option<String>,
    pub content: Content,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    link: Option<String>,
    duration: i64,
    zone: i64,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    width: Option<i64>,
}

#[derive(Deserialize)]
struct ImageContent {
    image: String,
}

#[derive(Deserialize)]
struct TextContent {
    title: String,
    text: String,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self.content {
            Content::Image { .. } => MessageKind::Image,
            Content::Text { .. } => MessageKind::Text,
        }
    }

    /// Parse a catalog message body. The discriminator is read from `type`
    /// (or `kind`) before any other field so unknown kinds are reported as
    /// such even when the rest of the payload does not fit either variant.
    pub fn parse(id: i64, body: &Value) -> Result<Self, MessageError> {
        let kind = body
            .get("type")
            .or_else(|| body.get("kind"))
            .and_then(Value::as_str)
            .ok_or_else(|| MessageError::Malformed("missing `type` discriminator".into()))?
            .to_ascii_lowercase();
        if kind != "image" && kind != "text" {
            return Err(MessageError::UnsupportedKind(kind));
        }

        let raw: RawMessage = serde_json::from_value(body.clone())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;

        let zone = u8::try_from(raw.zone)
            .ok()
            .filter(|z| *z < ZONE_COUNT)
            .ok_or_else(|| MessageError::Malformed(format!("zone {} out of range", raw.zone)))?;
        let duration_seconds = u32::try_from(raw.duration)
            .map_err(|_| MessageError::Malformed(format!("invalid duration {}", raw.duration)))?;

        let content = if kind == "image" {
            let c: ImageContent = serde_json::from_value(raw.content)
                .map_err(|e| MessageError::Malformed(format!("content: {}", e)))?;
            let width = match raw.width {
                None => DEFAULT_IMAGE_WIDTH,
                Some(w) => u32::try_from(w)
                    .ok()
                    .filter(|w| *w > 0)
                    .ok_or_else(|| MessageError::Malformed(format!("invalid width {}", w)))?,
            };
            Content::Image {
                image: c.image,
                width,
            }
        } else {
            let c: TextContent = serde_json::from_value(raw.content)
                .map_err(|e| MessageError::Malformed(format!("content: {}", e)))?;
            Content::Text {
                title: c.title,
                text: c.text,
            }
        };

        Ok(Self {
            id,
            zone,
            duration_seconds,
            link: raw.link.filter(|l| !l.trim().is_empty()),
            content,
        })
    }

    /// Serialize back into the catalog body shape accepted by [`Message::parse`].
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "type": self.kind().as_str(),
            "link": self.link,
            "duration": self.duration_seconds,
            "zone": self.zone,
        });
        match &self.content {
            Content::Image { image, width } => {
                body["content"] = json!({ "image": image });
                body["width"] = json!(width);
            }
            Content::Text { title, text } => {
                body["content"] = json!({ "title": title, "text": text });
            }
        }
        body
    }
}

/// Signals reported by the display surface once a window has closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceSignals {
    pub clicked: bool,
    pub hovered: bool,
}

/// Pointer activity observed while a message was on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngagementState {
    #[serde(rename = "Inactivo")]
    Inactive,
    #[serde(rename = "Activo")]
    Active,
    #[serde(rename = "Leído")]
    Read,
    #[serde(rename = "Accedido")]
    Accessed,
}

impl EngagementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementState::Inactive => "Inactivo",
            EngagementState::Active => "Activo",
            EngagementState::Read => "Leído",
            EngagementState::Accessed => "Accedido",
        }
    }

    /// Clicked beats hovered, hovered beats pointer movement.
    pub fn classify(signals: SurfaceSignals, activity: Activity) -> Self {
        if signals.clicked {
            EngagementState::Accessed
        } else if signals.hovered {
            EngagementState::Read
        } else if activity == Activity::Active {
            EngagementState::Active
        } else {
            EngagementState::Inactive
        }
    }
}

/// Classified result of one display, handed to the outcome logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagementOutcome {
    pub message_id: i64,
    pub state: EngagementState,
    pub zone: u8,
    pub timestamp: DateTime<Utc>,
}
