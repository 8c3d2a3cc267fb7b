//! Credential orchestration.
//!
//! Before a tool runs, each credential tool it declares must yield an env
//! mapping. Resolution order per name: CLI override, store lookup (GitHub
//! tools only), then running the credential tool as a sub-call. Acquisition
//! is serialized runner-wide because credential tools typically prompt a
//! human.

use crate::error::RunnerError;
use crate::runner::Runner;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use weft_contract::{
    is_github_tool, CallContext, Credential, CredentialStore, CredentialStoreError,
    CredentialType, Monitor, ProgramError, ToolCategory,
};

/// Credential acquisition failures, each carrying the offending credential
/// tool name.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to open credential store: {source}")]
    OpenStore {
        #[source]
        source: CredentialStoreError,
    },

    #[error("failed to get credentials for tool {name}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: CredentialStoreError,
    },

    #[error("failed to find ID for tool {name}")]
    MappingNotFound { name: String },

    #[error("failed to run credential tool {name}: {source}")]
    Run {
        name: String,
        #[source]
        source: Box<RunnerError>,
    },

    #[error("invalid state: credential tool [{name}] can not result in a continuation")]
    NotTerminal { name: String },

    #[error("failed to unmarshal credential tool {name} response: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to add credential for tool {name}: {source}")]
    Save {
        name: String,
        #[source]
        source: CredentialStoreError,
    },
}

#[derive(Deserialize)]
struct EnvResponse {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl Runner {
    /// Extend `env` with the output of every credential tool declared by the
    /// frame's tool.
    pub(crate) async fn handle_credentials(
        &self,
        ctx: &CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
    ) -> Result<Vec<String>, RunnerError> {
        // Credential tools usually prompt the user; run one at a time.
        let _guard = self.cred_mutex.lock().await;

        let store = self
            .store_factory
            .open(&self.cred_ctx)
            .await
            .map_err(|source| CredentialError::OpenStore { source })?;

        let mut env = env.to_vec();
        for tool_name in &ctx.tool.credentials {
            // An override wins before the store or the tool is consulted.
            if let Some(overridden) = self.cred_overrides.get(tool_name) {
                for (key, value) in overridden {
                    env.push(format!("{key}={value}"));
                }
                continue;
            }

            let mut credential = None;
            if is_github_tool(tool_name) {
                credential =
                    store
                        .get(tool_name)
                        .await
                        .map_err(|source| CredentialError::Lookup {
                            name: tool_name.clone(),
                            source,
                        })?;
            }

            let credential = match credential {
                Some(credential) => credential,
                None => {
                    self.acquire_credential(ctx, monitor, &env, &store, tool_name)
                        .await?
                }
            };

            for (key, value) in &credential.env {
                env.push(format!("{key}={value}"));
            }
        }

        Ok(env)
    }

    /// Run the credential tool behind `tool_name` and persist the result
    /// when eligible.
    async fn acquire_credential(
        &self,
        ctx: &CallContext,
        monitor: &Arc<dyn Monitor>,
        env: &[String],
        store: &Arc<dyn CredentialStore>,
        tool_name: &str,
    ) -> Result<Credential, RunnerError> {
        let refs = ctx.tool.tool_mapping.get(tool_name).ok_or_else(|| {
            CredentialError::MappingNotFound {
                name: tool_name.to_string(),
            }
        })?;
        if refs.len() != 1 {
            return Err(ProgramError::AmbiguousToolMapping {
                name: tool_name.to_string(),
                count: refs.len(),
            }
            .into());
        }
        let tool_id = refs[0].tool_id.clone();

        let sub_ctx = ctx.sub_call("", &tool_id, "", ToolCategory::Credential)?;
        let result = self
            .call(sub_ctx, monitor, env, String::new())
            .await
            .map_err(|source| CredentialError::Run {
                name: tool_name.to_string(),
                source: Box::new(source),
            })?;

        let Some(output) = result.result else {
            return Err(CredentialError::NotTerminal {
                name: tool_name.to_string(),
            }
            .into());
        };

        let response: EnvResponse =
            serde_json::from_str(&output).map_err(|source| CredentialError::Decode {
                name: tool_name.to_string(),
                source,
            })?;

        let credential = Credential {
            tool_name: tool_name.to_string(),
            credential_type: CredentialType::Tool,
            env: response.env,
        };

        let from_repo = ctx
            .program
            .get_tool(&tool_id)
            .map(|tool| tool.source.repo.is_some())
            .unwrap_or(false);

        if is_github_tool(tool_name) && from_repo {
            if credential.is_empty() {
                warn!(tool = tool_name, "not saving empty credential");
            } else {
                store
                    .add(credential.clone())
                    .await
                    .map_err(|source| CredentialError::Save {
                        name: tool_name.to_string(),
                        source,
                    })?;
            }
        } else {
            warn!(
                tool = tool_name,
                "not saving credential for local tool, credentials are only saved for tools from GitHub"
            );
        }

        Ok(credential)
    }
}
