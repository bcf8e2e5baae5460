use std::collections::HashSet;
use std::path::Path;

use gateway_client::GatewayClientOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One Gateway to probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub instance_id: String,
    pub gateway: GatewayClientOptions,
}

#[derive(Debug, Error)]
pub enum InstanceFileError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid instance file: {0}")]
    Invalid(String),
}

/// Load the instance list. A missing or blank file is an empty fleet.
pub async fn load_instances(path: &Path) -> Result<Vec<InstanceConfig>, InstanceFileError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| InstanceFileError::Storage(format!("Failed to read instances: {}", err)))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let instances: Vec<InstanceConfig> = serde_json::from_str(&content)
        .map_err(|err| InstanceFileError::Invalid(format!("Failed to parse instances: {}", err)))?;

    let mut seen = HashSet::new();
    for instance in &instances {
        if instance.instance_id.trim().is_empty() {
            return Err(InstanceFileError::Invalid("instanceId must not be empty".to_string()));
        }
        if !seen.insert(instance.instance_id.as_str()) {
            return Err(InstanceFileError::Invalid(format!(
                "duplicate instanceId {}",
                instance.instance_id
            )));
        }
    }
    Ok(instances)
}
