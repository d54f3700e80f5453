use serde::Deserialize;
use serde_json::{Map, Value};

const META_PREFIXES: [&str; 3] = [
    "<command-name>",
    "<local-command-stdout>",
    "<local-command-caveat>",
];

const IDE_TAG_PREFIXES: [&str; 2] = ["<ide_selection", "<ide_opened_file"];

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Image {
        #[serde(default)]
        source: Option<Value>,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        is_error: Option<bool>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserRecord {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: String,
    pub session_id: String,
    pub slug: Option<String>,
    pub permission_mode: Option<String>,
    pub cwd: String,
    pub git_branch: String,
    pub is_sidechain: bool,
    pub content: MessageContent,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssistantRecord {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: String,
    pub is_sidechain: bool,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionRecord {
    User(UserRecord),
    Assistant(AssistantRecord),
}

impl SessionRecord {
    pub fn timestamp(&self) -> &str {
        match self {
            Self::User(record) => &record.timestamp,
            Self::Assistant(record) => &record.timestamp,
        }
    }

    pub fn is_sidechain(&self) -> bool {
        match self {
            Self::User(record) => record.is_sidechain,
            Self::Assistant(record) => record.is_sidechain,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    uuid: Option<String>,
    parent_uuid: Option<String>,
    timestamp: Option<String>,
    session_id: Option<String>,
    slug: Option<String>,
    permission_mode: Option<String>,
    cwd: Option<String>,
    git_branch: Option<String>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Value,
    model: Option<String>,
    stop_reason: Option<String>,
}

/// Parses one log line. Anything that is not a well-formed user or
/// assistant record yields `None`.
pub fn parse_record(line: &str) -> Option<SessionRecord> {
    let raw: RawRecord = serde_json::from_str(line).ok()?;
    let message = raw.message?;

    match raw.record_type.as_deref() {
        Some("user") => {
            let content = match message.content {
                Value::String(text) => MessageContent::Text(text),
                other => MessageContent::Blocks(parse_blocks(other)),
            };
            Some(SessionRecord::User(UserRecord {
                uuid: raw.uuid.unwrap_or_default(),
                parent_uuid: raw.parent_uuid,
                timestamp: raw.timestamp.unwrap_or_default(),
                session_id: raw.session_id.unwrap_or_default(),
                slug: raw.slug,
                permission_mode: raw.permission_mode,
                cwd: raw.cwd.unwrap_or_default(),
                git_branch: raw.git_branch.unwrap_or_default(),
                is_sidechain: raw.is_sidechain.unwrap_or(false),
                content,
            }))
        }
        Some("assistant") => Some(SessionRecord::Assistant(AssistantRecord {
            uuid: raw.uuid.unwrap_or_default(),
            parent_uuid: raw.parent_uuid,
            timestamp: raw.timestamp.unwrap_or_default(),
            is_sidechain: raw.is_sidechain.unwrap_or(false),
            model: message.model.unwrap_or_default(),
            content: parse_blocks(message.content),
            stop_reason: message.stop_reason,
        })),
        _ => None,
    }
}

fn parse_blocks(value: Value) -> Vec<ContentBlock> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

fn is_ide_tag(text: &str) -> bool {
    let trimmed = text.trim_start();
    IDE_TAG_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
}

/// Plain text of a user message. IDE context blocks are left out.
pub fn user_text(record: &UserRecord) -> String {
    match &record.content {
        MessageContent::Text(text) => text.trim().to_string(),
        MessageContent::Blocks(blocks) => join_text_blocks(blocks, |text| !is_ide_tag(text)),
    }
}

/// Plain text of an assistant message, without thinking or tool blocks.
pub fn assistant_text(record: &AssistantRecord) -> String {
    join_text_blocks(&record.content, |_| true)
}

fn join_text_blocks(blocks: &[ContentBlock], keep: impl Fn(&str) -> bool) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.trim().is_empty() && keep(text) => {
                Some(text.as_str())
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Slash commands and their local output are tooling noise, not prompts.
pub fn is_meta_message(record: &UserRecord) -> bool {
    is_meta_text(&user_text(record))
}

pub fn is_meta_text(text: &str) -> bool {
    let trimmed = text.trim_start();
    META_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix))
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolUse<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a Value,
}

pub fn tool_uses(record: &AssistantRecord) -> Vec<ToolUse<'_>> {
    record
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolUse { id, name, input }),
            _ => None,
        })
        .collect()
}

/// Tool-invocation ids answered by this record, with their success flag.
pub fn tool_results(record: &UserRecord) -> Vec<(String, bool)> {
    let MessageContent::Blocks(blocks) = &record.content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
            } => Some((tool_use_id.clone(), !is_error.unwrap_or(false))),
            _ => None,
        })
        .collect()
}

pub fn input_as_args(input: &Value) -> Map<String, Value> {
    match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    }
}
