//! Program and tool definitions.
//!
//! A [`Program`] is the immutable input to a run: a keyed table of tools plus
//! the id of the entry tool. Tools are produced by an external loader; the
//! runner only reads them.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors arising from the program table or tool references.
#[derive(Debug, Clone, Error)]
pub enum ProgramError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool mapping for {name} must resolve to exactly one tool, found {count}")]
    AmbiguousToolMapping { name: String, count: usize },

    #[error("can not bind context arg for tool [{tool_id}]: {reason}")]
    InvalidContextBinding { tool_id: String, reason: String },
}

/// Built-in tools that never require authorization.
pub const SAFE_TOOLS: &[&str] = &[
    "sys.chat.current",
    "sys.chat.finish",
    "sys.chat.history",
    "sys.context",
    "sys.echo",
    "sys.prompt",
    "sys.time.now",
];

/// Whether a tool id is on the built-in safe-list.
pub fn is_safe_tool(tool_id: &str) -> bool {
    SAFE_TOOLS.contains(&tool_id)
}

/// An immutable tool program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Program {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub entry_tool_id: String,
    pub tool_set: BTreeMap<String, Tool>,
}

impl Program {
    /// Look up a tool by id.
    pub fn get_tool(&self, tool_id: &str) -> Result<&Tool, ProgramError> {
        self.tool_set
            .get(tool_id)
            .ok_or_else(|| ProgramError::ToolNotFound(tool_id.to_string()))
    }

    /// The ordered context-provider references declared by a tool.
    pub fn get_context_tool_refs(&self, tool_id: &str) -> Result<Vec<ToolReference>, ProgramError> {
        Ok(self.get_tool(tool_id)?.context.clone())
    }
}

/// A single node of a program: LLM instructions, a built-in, or an external
/// command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tool {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    /// Chat tools do not auto-terminate on a final LLM result; they wait for
    /// further user input until the chat-finish built-in is invoked.
    #[serde(skip_serializing_if = "is_false")]
    pub chat: bool,
    /// Command line for external-command tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Names of credential tools to run before this tool.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
    /// Context-provider tools whose output is injected into this tool's
    /// prompt, in declaration order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ToolReference>,
    /// Resolution of referenced names to concrete tool ids.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_mapping: BTreeMap<String, Vec<ToolReference>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonSchema>,
    pub source: ToolSource,
}

impl Tool {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Whether this tool executes an external command rather than LLM
    /// instructions.
    pub fn is_command(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.is_empty())
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_chat(mut self, chat: bool) -> Self {
        self.chat = chat;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_arguments(mut self, arguments: JsonSchema) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn with_context(mut self, reference: ToolReference) -> Self {
        self.context.push(reference);
        self
    }

    pub fn with_credential(mut self, name: impl Into<String>) -> Self {
        self.credentials.push(name.into());
        self
    }

    pub fn with_mapping(mut self, name: impl Into<String>, refs: Vec<ToolReference>) -> Self {
        self.tool_mapping.insert(name.into(), refs);
        self
    }
}

/// A resolved reference from one tool to another, optionally carrying an
/// argument-binding expression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolReference {
    pub tool_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
}

impl ToolReference {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            arg: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }
}

/// Where a tool definition came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSource {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<Repo>,
}

/// A VCS revision a tool was loaded from. Credentials are only persisted for
/// tools that carry one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Repo {
    pub root: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub revision: String,
}

/// JSON schema subset used for tool argument declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JsonSchema {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type", skip_serializing_if = "SchemaType::is_empty")]
    pub schema_type: SchemaType,
    pub properties: BTreeMap<String, JsonSchema>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

/// Build an object schema from alternating name/description pairs, each a
/// string property.
pub fn object_schema<'a>(kv: impl IntoIterator<Item = (&'a str, &'a str)>) -> JsonSchema {
    let mut schema = JsonSchema {
        schema_type: SchemaType::from("object"),
        ..Default::default()
    };
    for (name, description) in kv {
        schema.properties.insert(
            name.to_string(),
            JsonSchema {
                description: description.to_string(),
                schema_type: SchemaType::from("string"),
                ..Default::default()
            },
        );
    }
    schema
}

/// A schema `type` field, which external definitions write either as a single
/// string or as an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaType(pub Vec<String>);

impl SchemaType {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SchemaType {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl Serialize for SchemaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.len() {
            0 => serializer.serialize_none(),
            1 => serializer.serialize_str(&self.0[0]),
            _ => self.0.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SchemaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TypeVisitor;

        impl<'de> Visitor<'de> for TypeVisitor {
            type Value = SchemaType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a type string, an array of type strings, or null")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(SchemaType(vec![value.to_string()]))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(SchemaType::default())
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(SchemaType::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<String>()? {
                    values.push(value);
                }
                Ok(SchemaType(values))
            }
        }

        deserializer.deserialize_any(TypeVisitor)
    }
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
