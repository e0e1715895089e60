use serde::{Deserialize, Serialize};

// --- Chat kind ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Single,
    Group,
    Agent,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Single => "single",
            ChatKind::Group => "group",
            ChatKind::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<ChatKind> {
        match s {
            "single" => Some(ChatKind::Single),
            "group" => Some(ChatKind::Group),
            "agent" => Some(ChatKind::Agent),
            _ => None,
        }
    }
}

// --- Message status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Recalled,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Failed,
        MessageStatus::Recalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Recalled => "recalled",
        }
    }

    pub fn parse(s: &str) -> Option<MessageStatus> {
        match s {
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            "recalled" => Some(MessageStatus::Recalled),
            _ => None,
        }
    }

    /// Legal transitions: sending → sent | failed; sent → delivered → read
    /// (forward steps may be skipped); recalled from any post-sent state;
    /// failed → sending only through the explicit retry operation.
    pub fn can_transition(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Sent, Recalled)
                | (Delivered, Read)
                | (Delivered, Recalled)
                | (Read, Recalled)
                | (Failed, Sending)
        )
    }

    /// Every state with a legal transition into `next`. The store's
    /// compare-and-set writes build their guard from this, so the lattice
    /// above is the only place transitions are defined.
    pub fn sources_of(next: MessageStatus) -> Vec<MessageStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition(next))
            .collect()
    }
}

// --- Message content (tagged union, one variant per wire type) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
    },
    Audio {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<i64>,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cover_url: Option<String>,
    },
    File {
        url: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<i64>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Card {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cover_url: Option<String>,
    },
    Music {
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
    },
    Document {
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_count: Option<i64>,
    },
    Code {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Ppt {
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slide_count: Option<i64>,
    },
    Character {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona: Option<String>,
    },
    Model3d {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    System {
        text: String,
    },
    Custom {
        payload: serde_json::Value,
    },
}

impl MessageContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Image { .. } => "image",
            MessageContent::Audio { .. } => "audio",
            MessageContent::Video { .. } => "video",
            MessageContent::File { .. } => "file",
            MessageContent::Location { .. } => "location",
            MessageContent::Card { .. } => "card",
            MessageContent::Music { .. } => "music",
            MessageContent::Document { .. } => "document",
            MessageContent::Code { .. } => "code",
            MessageContent::Ppt { .. } => "ppt",
            MessageContent::Character { .. } => "character",
            MessageContent::Model3d { .. } => "model3d",
            MessageContent::System { .. } => "system",
            MessageContent::Custom { .. } => "custom",
        }
    }

    /// Parse a declared type + bare content object into the tagged union.
    /// Rejects content whose shape does not match the declared type.
    pub fn from_typed(msg_type: &str, content: &serde_json::Value) -> Result<Self, String> {
        let mut obj = match content {
            serde_json::Value::Object(map) => map.clone(),
            _ => return Err("content must be a JSON object".to_string()),
        };
        obj.insert(
            "type".to_string(),
            serde_json::Value::String(msg_type.to_string()),
        );
        serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| format!("content does not match declared type '{msg_type}': {e}"))
    }

    /// Conversation-list preview for this content.
    pub fn snippet(&self, max_chars: usize) -> String {
        match self {
            MessageContent::Text { text } => text.chars().take(max_chars).collect(),
            MessageContent::Image { .. } => "[Image]".to_string(),
            MessageContent::Audio { .. } => "[Audio]".to_string(),
            MessageContent::Video { .. } => "[Video]".to_string(),
            MessageContent::File { .. } => "[File]".to_string(),
            MessageContent::Location { .. } => "[Location]".to_string(),
            MessageContent::Card { .. } => "[Card]".to_string(),
            MessageContent::Music { .. } => "[Music]".to_string(),
            MessageContent::Document { .. } => "[Document]".to_string(),
            MessageContent::Code { .. } => "[Code]".to_string(),
            MessageContent::Ppt { .. } => "[Slides]".to_string(),
            MessageContent::Character { .. } => "[Character]".to_string(),
            MessageContent::Model3d { .. } => "[3D Model]".to_string(),
            MessageContent::System { .. } => "[System]".to_string(),
            MessageContent::Custom { .. } => "[Custom]".to_string(),
        }
    }

    /// The searchable text of this content, if any. This is what lands in
    /// the full-text index.
    pub fn body_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } | MessageContent::System { text } => Some(text),
            MessageContent::Code { code, .. } => Some(code),
            MessageContent::Card { title, .. }
            | MessageContent::Music { title, .. }
            | MessageContent::Document { title, .. }
            | MessageContent::Ppt { title, .. } => Some(title),
            MessageContent::File { name, .. } | MessageContent::Character { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }
}

// --- Message ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    pub content: MessageContent,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_from: Option<String>,
    pub status: MessageStatus,
    pub retry_count: i64,
    pub need_read_receipt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recalled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    pub created_at: String,
    pub extra: serde_json::Value,
}

// --- Conversation ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub peer: String,
    pub kind: ChatKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
    pub last_message_seq: i64,
    pub unread_count: i64,
    pub is_pinned: bool,
    pub is_muted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// --- Group & membership ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub member_count: i64,
    pub max_members: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    pub role: String,
    pub status: String,
    pub joined_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_until: Option<String>,
}

// --- Friendship edge (directed; blocking is asymmetric) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub user_id: String,
    pub target_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

// --- Ingest API shapes ---

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: serde_json::Value,
    pub from_user_id: String,
    #[serde(default)]
    pub to_user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub forward_from_id: Option<String>,
    #[serde(default)]
    pub client_seq: Option<i64>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default)]
    pub need_read_receipt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub is_duplicate: bool,
}

impl SendResult {
    pub fn ok(message: Message) -> Self {
        SendResult {
            success: true,
            message: Some(message),
            error: None,
            error_kind: None,
            is_duplicate: false,
        }
    }

    pub fn duplicate(existing: Option<Message>) -> Self {
        SendResult {
            success: true,
            message: existing,
            error: None,
            error_kind: None,
            is_duplicate: true,
        }
    }

    pub fn failure(err: &crate::error::SendError) -> Self {
        SendResult {
            success: false,
            message: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            is_duplicate: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecallRequest {
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub from_user_id: String,
    #[serde(default)]
    pub to_user_ids: Vec<String>,
    #[serde(default)]
    pub to_group_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub messages: Vec<Message>,
    pub total: usize,
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub sent: i64,
    pub received: i64,
    pub by_type: std::collections::HashMap<String, i64>,
}

// --- Fixture surface for the collaborating services ---

#[derive(Debug, Deserialize)]
pub struct CreateGroup {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub owner_user_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default = "default_max_members")]
    pub max_members: i64,
}

fn default_max_members() -> i64 {
    500
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub user_id: String,
    #[serde(default = "default_member_role")]
    pub role: String,
}

fn default_member_role() -> String {
    "member".to_string()
}

#[derive(Debug, Deserialize)]
pub struct MuteMember {
    pub user_id: String,
    /// Seconds from now; 0 clears the mute.
    pub duration_secs: i64,
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub user_id: String,
    pub target_id: String,
}
