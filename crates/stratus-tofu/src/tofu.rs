//! tofu CLI wrapper
//!
//! Runs one module against one entity's working directory. The working
//! directory holds everything that belongs to the entity:
//!
//! ```text
//! <work_dir>/<project>/<environment>/<name>/
//!   inputs.tfvars.json
//!   terraform.tfstate
//!   apply.log
//!   .terraform/
//! ```

use crate::error::{Result, TofuError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const TFVARS_FILE: &str = "inputs.tfvars.json";
pub const STATE_FILE: &str = "terraform.tfstate";
pub const LOG_FILE: &str = "apply.log";

/// tofu CLI bound to a module and a working directory
pub struct Tofu {
    binary: String,
    module_dir: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl Tofu {
    pub fn new(
        binary: impl Into<String>,
        module_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            module_dir: module_dir.into(),
            work_dir: work_dir.into(),
            timeout,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log_file(&self) -> PathBuf {
        self.work_dir.join(LOG_FILE)
    }

    fn state_arg(&self) -> String {
        format!("-state={}", self.work_dir.join(STATE_FILE).display())
    }

    fn var_file_arg(&self) -> String {
        format!("-var-file={}", self.work_dir.join(TFVARS_FILE).display())
    }

    /// Run a tofu command and return stdout
    ///
    /// Output of every command is appended to `apply.log`.
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-chdir={}", self.module_dir.display()));
        cmd.args(args);
        cmd.env("TF_DATA_DIR", self.work_dir.join(".terraform"));
        cmd.env("TF_IN_AUTOMATION", "1");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running: {}", command);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TofuError::BinaryNotFound(self.binary.clone()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                self.append_log(&command, b"", b"timed out").await?;
                return Err(TofuError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        self.append_log(&command, &output.stdout, &output.stderr)
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TofuError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn append_log(&self, command: &str, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file())
            .await?;
        log.write_all(format!("$ {}\n", command).as_bytes()).await?;
        log.write_all(stdout).await?;
        log.write_all(stderr).await?;
        log.write_all(b"\n").await?;
        Ok(())
    }

    /// Create the working directory and write the variables file
    pub async fn prepare(&self, inputs: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let tfvars = serde_json::to_string_pretty(inputs)?;
        tokio::fs::write(self.work_dir.join(TFVARS_FILE), tfvars).await?;
        Ok(())
    }

    pub async fn init(&self) -> Result<()> {
        self.run_command(&["init", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    pub async fn apply(&self) -> Result<()> {
        let state = self.state_arg();
        let var_file = self.var_file_arg();
        self.run_command(&[
            "apply",
            "-auto-approve",
            "-input=false",
            "-no-color",
            state.as_str(),
            var_file.as_str(),
        ])
        .await?;
        Ok(())
    }

    /// Output values by name
    pub async fn output(&self) -> Result<Map<String, Value>> {
        let state = self.state_arg();
        let stdout = self
            .run_command(&["output", "-json", "-no-color", state.as_str()])
            .await?;
        parse_outputs(&stdout).map_err(|message| TofuError::InvalidOutput {
            command: format!("{} output -json", self.binary),
            message,
        })
    }

    pub async fn destroy(&self) -> Result<()> {
        let state = self.state_arg();
        let var_file = self.var_file_arg();
        self.run_command(&[
            "destroy",
            "-auto-approve",
            "-input=false",
            "-no-color",
            state.as_str(),
            var_file.as_str(),
        ])
        .await?;
        Ok(())
    }
}

/// Parse `tofu output -json` (`{"name": {"value": ..., "type": ..., "sensitive": ...}}`)
pub fn parse_outputs(stdout: &str) -> std::result::Result<Map<String, Value>, String> {
    if stdout.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    let Value::Object(entries) = parsed else {
        return Err("expected a JSON object".to_string());
    };

    entries
        .into_iter()
        .map(|(name, entry)| match entry.get("value") {
            Some(value) => Ok((name, value.clone())),
            None => Err(format!("output '{}' has no value", name)),
        })
        .collect()
}

/// Merge outputs into the applied inputs; output `id` becomes the provider id
pub fn merge_outputs(inputs: &Value, outputs: Map<String, Value>) -> (Value, Option<String>) {
    let mut merged = match inputs {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let mut provider_id = None;
    for (name, value) in outputs {
        if name == "id" {
            provider_id = match &value {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            };
            continue;
        }
        merged.insert(name, value);
    }
    (Value::Object(merged), provider_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_outputs() {
        let stdout = r#"{
  "id": {"sensitive": false, "type": "string", "value": "bucket-123"},
  "ports": {"sensitive": false, "type": ["list", "number"], "value": [80, 443]}
}"#;
        let outputs = parse_outputs(stdout).unwrap();
        assert_eq!(outputs["id"], json!("bucket-123"));
        assert_eq!(outputs["ports"], json!([80, 443]));
    }

    #[test]
    fn test_parse_outputs_empty() {
        assert!(parse_outputs("").unwrap().is_empty());
        assert!(parse_outputs("{}\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_outputs_rejects_garbage() {
        assert!(parse_outputs("[1, 2]").is_err());
        assert!(parse_outputs(r#"{"id": {"type": "string"}}"#).is_err());
        assert!(parse_outputs("not json").is_err());
    }

    #[test]
    fn test_merge_outputs() {
        let inputs = json!({"size": 1, "region": "eu"});
        let mut outputs = Map::new();
        outputs.insert("id".to_string(), json!("bucket-123"));
        outputs.insert("url".to_string(), json!("gs://bucket"));
        outputs.insert("region".to_string(), json!("europe-west1"));

        let (merged, provider_id) = merge_outputs(&inputs, outputs);

        assert_eq!(provider_id.as_deref(), Some("bucket-123"));
        assert_eq!(
            merged,
            json!({"size": 1, "region": "europe-west1", "url": "gs://bucket"})
        );
    }

    #[test]
    fn test_merge_outputs_numeric_id() {
        let mut outputs = Map::new();
        outputs.insert("id".to_string(), json!(42));
        let (_, provider_id) = merge_outputs(&json!({}), outputs);
        assert_eq!(provider_id.as_deref(), Some("42"));
    }
}
