//! Credentials and the credential store contract.
//!
//! Credential tools emit an `{"env": {...}}` mapping that is appended to the
//! environment of the tool that declared them. Values obtained from tools
//! hosted on GitHub may be persisted in a store keyed by `(credCtx, tool
//! name)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Whether a credential tool name refers to a GitHub-hosted tool. Only those
/// are looked up in, and persisted to, the store.
pub fn is_github_tool(tool_name: &str) -> bool {
    tool_name.starts_with("github.com")
}

/// What produced a credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialType {
    /// Produced by running a credential tool.
    #[default]
    Tool,
    /// An API key captured for a model provider.
    ModelProvider,
}

/// A stored credential: environment entries for one tool name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credential {
    pub tool_name: String,
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub env: BTreeMap<String, String>,
}

impl Credential {
    /// Whether every env value is empty. Empty credentials are never
    /// persisted.
    pub fn is_empty(&self) -> bool {
        self.env.values().all(|v| v.is_empty())
    }
}

/// Failure talking to a credential store backend.
#[derive(Debug, Clone, Error)]
#[error("credential store failure: {0}")]
pub struct CredentialStoreError(pub String);

/// A store of credentials for one credential context.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, tool_name: &str) -> Result<Option<Credential>, CredentialStoreError>;

    async fn add(&self, credential: Credential) -> Result<(), CredentialStoreError>;
}

/// Opens a [`CredentialStore`] scoped to a credential context.
#[async_trait]
pub trait CredentialStoreFactory: Send + Sync {
    async fn open(&self, cred_ctx: &str)
        -> Result<Arc<dyn CredentialStore>, CredentialStoreError>;
}

/// Process-local store used when no backing secrets plugin is configured.
#[derive(Default)]
pub struct MemoryCredentialStoreFactory {
    entries: Arc<Mutex<HashMap<(String, String), Credential>>>,
}

#[async_trait]
impl CredentialStoreFactory for MemoryCredentialStoreFactory {
    async fn open(
        &self,
        cred_ctx: &str,
    ) -> Result<Arc<dyn CredentialStore>, CredentialStoreError> {
        Ok(Arc::new(MemoryCredentialStore {
            cred_ctx: cred_ctx.to_string(),
            entries: self.entries.clone(),
        }))
    }
}

struct MemoryCredentialStore {
    cred_ctx: String,
    entries: Arc<Mutex<HashMap<(String, String), Credential>>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, tool_name: &str) -> Result<Option<Credential>, CredentialStoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(&(self.cred_ctx.clone(), tool_name.to_string()))
            .cloned())
    }

    async fn add(&self, credential: Credential) -> Result<(), CredentialStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (self.cred_ctx.clone(), credential.tool_name.clone()),
            credential,
        );
        Ok(())
    }
}

/// A malformed credential override item.
#[derive(Debug, Clone, Error)]
#[error("malformed credential override {0:?}, expected tool:KEY=value[,KEY=value...]")]
pub struct InvalidCredentialOverride(pub String);

/// Parse CLI credential overrides of the form `tool:KEY=value,KEY2=value2`.
///
/// A tool with an override never hits the store and its credential tool is
/// never run.
pub fn parse_credential_overrides(
    items: &[String],
) -> Result<HashMap<String, BTreeMap<String, String>>, InvalidCredentialOverride> {
    let mut overrides: HashMap<String, BTreeMap<String, String>> = HashMap::new();

    for item in items {
        let (tool_name, entries) = item
            .split_once(':')
            .ok_or_else(|| InvalidCredentialOverride(item.clone()))?;
        if tool_name.is_empty() {
            return Err(InvalidCredentialOverride(item.clone()));
        }

        let env = overrides.entry(tool_name.to_string()).or_default();
        for entry in entries.split(',') {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| InvalidCredentialOverride(item.clone()))?;
            if key.is_empty() {
                return Err(InvalidCredentialOverride(item.clone()));
            }
            env.insert(key.to_string(), value.to_string());
        }
    }

    Ok(overrides)
}
