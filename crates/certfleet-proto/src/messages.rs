//! Push channel frame and command types

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ManagedItem;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Argument key for commands targeting a single managed item
pub const ARG_ITEM_ID: &str = "itemId";
/// Argument key carrying a JSON-encoded [`ManagedItem`]
pub const ARG_ITEM: &str = "item";
/// Argument key bounding log retrieval
pub const ARG_MAX_LINES: &str = "maxLines";

/// Errors from encoding or decoding protocol payloads
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("missing command argument: {0}")]
    MissingArgument(&'static str),

    #[error("command result carried no payload")]
    EmptyResult,

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Commands the coordination server can send to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    /// Ask the instance who it is (identity binding)
    GetInstanceInfo,
    /// Fetch the instance's full managed item list
    GetInstanceItems,
    /// Fetch one managed item by id
    GetInstanceManagedItem,
    /// Store or update one managed item
    UpdateInstanceManagedItem,
    /// Delete one managed item
    DeleteInstanceManagedItem,
    /// Fetch the tail of one managed item's log
    GetInstanceManagedItemLog,
    /// Dry-run the configuration checks for one managed item
    TestInstanceManagedItem,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::GetInstanceInfo => "getInstanceInfo",
            CommandType::GetInstanceItems => "getInstanceItems",
            CommandType::GetInstanceManagedItem => "getInstanceManagedItem",
            CommandType::UpdateInstanceManagedItem => "updateInstanceManagedItem",
            CommandType::DeleteInstanceManagedItem => "deleteInstanceManagedItem",
            CommandType::GetInstanceManagedItemLog => "getInstanceManagedItemLog",
            CommandType::TestInstanceManagedItem => "testInstanceManagedItem",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key/value command argument
///
/// Values are strings on the wire; structured arguments (whole managed items)
/// are JSON-encoded into the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct CommandArg {
    pub key: String,
    pub value: String,
}

/// A correlated request sent to one instance over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Correlation id, minted fresh per request
    pub command_id: Uuid,
    pub command_type: CommandType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<CommandArg>,
}

impl CommandRequest {
    pub fn new(command_type: CommandType) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type,
            arguments: Vec::new(),
        }
    }

    /// Add one argument
    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.arguments.push(CommandArg {
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn get_instance_info() -> Self {
        Self::new(CommandType::GetInstanceInfo)
    }

    pub fn get_instance_items() -> Self {
        Self::new(CommandType::GetInstanceItems)
    }

    pub fn get_managed_item(item_id: &str) -> Self {
        Self::new(CommandType::GetInstanceManagedItem).with_arg(ARG_ITEM_ID, item_id)
    }

    pub fn update_managed_item(item: &ManagedItem) -> Result<Self, ProtoError> {
        Ok(Self::new(CommandType::UpdateInstanceManagedItem)
            .with_arg(ARG_ITEM, serde_json::to_string(item)?))
    }

    pub fn delete_managed_item(item_id: &str) -> Self {
        Self::new(CommandType::DeleteInstanceManagedItem).with_arg(ARG_ITEM_ID, item_id)
    }

    pub fn get_item_log(item_id: &str, max_lines: usize) -> Self {
        Self::new(CommandType::GetInstanceManagedItemLog)
            .with_arg(ARG_ITEM_ID, item_id)
            .with_arg(ARG_MAX_LINES, max_lines.to_string())
    }

    pub fn test_managed_item(item: &ManagedItem) -> Result<Self, ProtoError> {
        Ok(Self::new(CommandType::TestInstanceManagedItem)
            .with_arg(ARG_ITEM, serde_json::to_string(item)?))
    }

    /// Look up an argument by key
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    /// The `itemId` argument, required by item-scoped commands
    pub fn item_id(&self) -> Result<&str, ProtoError> {
        self.arg(ARG_ITEM_ID)
            .ok_or(ProtoError::MissingArgument(ARG_ITEM_ID))
    }

    /// Decode the JSON-encoded `item` argument
    pub fn item(&self) -> Result<ManagedItem, ProtoError> {
        let raw = self
            .arg(ARG_ITEM)
            .ok_or(ProtoError::MissingArgument(ARG_ITEM))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// The `maxLines` argument, when present and numeric
    pub fn max_lines(&self) -> Option<usize> {
        self.arg(ARG_MAX_LINES).and_then(|v| v.parse().ok())
    }
}

/// A correlated result for a previously dispatched [`CommandRequest`]
///
/// `value` carries the JSON-encoded payload. `None` means the instance had
/// nothing to return; the server also synthesizes a `None` result when a
/// command times out without any response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CommandResult {
    /// Build a result carrying a JSON payload
    pub fn ok<T: Serialize>(command_id: Uuid, payload: &T) -> Result<Self, ProtoError> {
        Ok(Self {
            command_id,
            value: Some(serde_json::to_string(payload)?),
        })
    }

    /// Build a result with no payload
    pub fn empty(command_id: Uuid) -> Self {
        Self {
            command_id,
            value: None,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Decode the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        let raw = self.value.as_deref().ok_or(ProtoError::EmptyResult)?;
        Ok(serde_json::from_str(raw)?)
    }
}

/// Envelope for every frame on the push channel
///
/// Serialized as JSON text frames with an external `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    /// Server asks an instance to run a command
    CommandRequest { request: CommandRequest },
    /// Instance answers a previously received command
    CommandResult { result: CommandResult },
    /// Free-form notification from an instance (logged by the server)
    InstanceMessage { message: String },
}

impl HubFrame {
    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemHealth;

    #[test]
    fn test_command_type_wire_names() {
        let json = serde_json::to_string(&CommandType::GetInstanceManagedItemLog).unwrap();
        assert_eq!(json, "\"getInstanceManagedItemLog\"");
        assert_eq!(CommandType::GetInstanceInfo.to_string(), "getInstanceInfo");
    }

    #[test]
    fn test_request_arguments() {
        let request = CommandRequest::get_item_log("site-1", 50);
        assert_eq!(request.command_type, CommandType::GetInstanceManagedItemLog);
        assert_eq!(request.arg(ARG_ITEM_ID), Some("site-1"));
        assert_eq!(request.max_lines(), Some(50));
        assert!(request.arg("missing").is_none());
    }

    #[test]
    fn test_item_argument_round_trip() {
        let item = ManagedItem::new("example.com cert")
            .with_domains(vec!["example.com".to_string()])
            .with_health(ItemHealth::Ok);
        let request = CommandRequest::update_managed_item(&item).unwrap();

        let decoded = request.item().unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_item_id_missing() {
        let request = CommandRequest::get_instance_items();
        assert!(matches!(
            request.item_id(),
            Err(ProtoError::MissingArgument(ARG_ITEM_ID))
        ));
    }

    #[test]
    fn test_result_decode() {
        let id = Uuid::new_v4();
        let result = CommandResult::ok(id, &vec!["line one".to_string()]).unwrap();
        let lines: Vec<String> = result.decode().unwrap();
        assert_eq!(lines, vec!["line one".to_string()]);

        let empty = CommandResult::empty(id);
        assert!(!empty.has_value());
        assert!(matches!(
            empty.decode::<Vec<String>>(),
            Err(ProtoError::EmptyResult)
        ));
    }

    #[test]
    fn test_frame_envelope_tag() {
        let frame = HubFrame::CommandRequest {
            request: CommandRequest::get_instance_info(),
        };
        let text = frame.to_text().unwrap();
        assert!(text.contains("\"type\":\"command_request\""));
        assert!(text.contains("\"commandType\":\"getInstanceInfo\""));

        let parsed = HubFrame::from_text(&text).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_frame_rejects_unknown_type() {
        let err = HubFrame::from_text("{\"type\":\"bogus\"}");
        assert!(err.is_err());
    }

    #[test]
    fn test_request_serialization_skips_empty_arguments() {
        let text = serde_json::to_string(&CommandRequest::get_instance_items()).unwrap();
        assert!(!text.contains("arguments"));
    }
}
