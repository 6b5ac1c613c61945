//! Tool names and typed views over tool `output_data` payloads.

use serde::Deserialize;
use serde_json::Value;

pub const EDIT_CODE: &str = "edit_code";
pub const CREATE_FILE: &str = "create_file";
pub const CREATE_FOLDER: &str = "create_folder";
pub const DELETE_FOLDER: &str = "delete_folder";
pub const RENAME_FOLDER: &str = "rename_folder";
pub const RENAME_FILE: &str = "rename_file";
pub const DELETE_FILE: &str = "delete_file";
pub const REQUEST_CODE_EXECUTION: &str = "request_code_execution";
pub const THINK: &str = "think";
pub const SANDBOX_RUN: &str = "sandbox_run";
pub const SANDBOX_SHOW_PREVIEW: &str = "sandbox_show_preview";

/// Typed completion output, resolved by tool name.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// `edit_code` / `create_file` success.
    FileWrite { file_path: String, content: String },
    /// `edit_code` / `create_file` reported an error instead of content.
    FileWriteError { error: String },
    Rename { old_path: String, new_path: String, folder: bool },
    DeleteFile { file_path: String },
    CreateFolder { folder_path: String },
    DeleteFolder { folder_path: String },
    ExecRequest {
        response_on_reject: Option<String>,
        resume_token: Option<String>,
        result: Option<String>,
    },
    Think(String),
    SandboxRun(SandboxRunOutput),
    ShowPreview { url: String, port: Option<u16>, label: Option<String> },
    /// Anything else, kept raw for the `tool_completed` action.
    Other(Value),
}

/// `sandbox_run` completion payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SandboxRunOutput {
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub fs: Option<FsDelta>,
}

/// File-system delta observed inside the sandbox after a run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FsDelta {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub updated: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
    /// Sampled contents; not every changed path is included.
    #[serde(default)]
    pub data: Vec<FsSample>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FsSample {
    pub path: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl ToolOutput {
    /// Interpret `output` according to the tool that produced it.
    pub fn parse(tool_name: &str, output: &Value) -> Self {
        let output = decode_embedded_json(output);
        let parsed = match tool_name {
            EDIT_CODE | CREATE_FILE => parse_file_write(&output),
            RENAME_FILE | RENAME_FOLDER => match (str_field(&output, "old_path"), str_field(&output, "new_path")) {
                (Some(old_path), Some(new_path)) => Some(Self::Rename {
                    old_path,
                    new_path,
                    folder: tool_name == RENAME_FOLDER,
                }),
                _ => None,
            },
            DELETE_FILE => str_field(&output, "file_path").map(|file_path| Self::DeleteFile { file_path }),
            CREATE_FOLDER => {
                str_field(&output, "folder_path").map(|folder_path| Self::CreateFolder { folder_path })
            }
            DELETE_FOLDER => {
                str_field(&output, "folder_path").map(|folder_path| Self::DeleteFolder { folder_path })
            }
            REQUEST_CODE_EXECUTION => Some(Self::ExecRequest {
                response_on_reject: str_field(&output, "response_on_reject"),
                resume_token: str_field(&output, "resume_token"),
                result: match output.get("result") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                },
            }),
            THINK => Some(Self::Think(match &output {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => str_field(other, "thought").unwrap_or_else(|| other.to_string()),
            })),
            SANDBOX_RUN => serde_json::from_value::<SandboxRunOutput>(output.clone())
                .ok()
                .map(Self::SandboxRun),
            SANDBOX_SHOW_PREVIEW => str_field(&output, "url").map(|url| Self::ShowPreview {
                url,
                port: output
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok()),
                label: str_field(&output, "label"),
            }),
            _ => None,
        };
        parsed.unwrap_or(Self::Other(output))
    }
}

fn parse_file_write(output: &Value) -> Option<ToolOutput> {
    if let Some(error) = str_field(output, "error") {
        return Some(ToolOutput::FileWriteError { error });
    }
    let file_path = str_field(output, "file_path")?;
    let content = str_field(output, "new_file_content")?;
    Some(ToolOutput::FileWrite { file_path, content })
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}

/// Tool outputs sometimes arrive as JSON-encoded strings.
pub fn decode_embedded_json(value: &Value) -> Value {
    if let Value::String(raw) = value {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                return parsed;
            }
        }
    }
    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_write_success_and_error() {
        assert_eq!(
            ToolOutput::parse(
                CREATE_FILE,
                &json!({"file_path": "main.py", "new_file_content": "print(1)"})
            ),
            ToolOutput::FileWrite {
                file_path: "main.py".into(),
                content: "print(1)".into()
            }
        );
        assert_eq!(
            ToolOutput::parse(EDIT_CODE, &json!({"error": "no such file"})),
            ToolOutput::FileWriteError {
                error: "no such file".into()
            }
        );
    }

    #[test]
    fn exec_request_output_carries_token() {
        let parsed = ToolOutput::parse(
            REQUEST_CODE_EXECUTION,
            &json!({"response_on_reject": "declined", "resume_token": "tok"}),
        );
        assert_eq!(
            parsed,
            ToolOutput::ExecRequest {
                response_on_reject: Some("declined".into()),
                resume_token: Some("tok".into()),
                result: None,
            }
        );
    }

    #[test]
    fn json_encoded_string_output_is_decoded() {
        let raw = json!(r#"{"old_path":"a","new_path":"b"}"#);
        assert_eq!(
            ToolOutput::parse(RENAME_FOLDER, &raw),
            ToolOutput::Rename {
                old_path: "a".into(),
                new_path: "b".into(),
                folder: true
            }
        );
    }

    #[test]
    fn sandbox_run_fs_delta_parses() {
        let out = ToolOutput::parse(
            SANDBOX_RUN,
            &json!({
                "exit_code": 0,
                "fs": {
                    "created": ["out.txt"],
                    "deleted": ["old.txt"],
                    "data": [{"path": "out.txt", "encoding": "base64", "content": "aGk="}]
                }
            }),
        );
        let ToolOutput::SandboxRun(run) = out else {
            panic!("expected sandbox run output");
        };
        let fs = run.fs.expect("fs delta");
        assert_eq!(fs.created, vec!["out.txt"]);
        assert_eq!(fs.data[0].encoding.as_deref(), Some("base64"));
        assert_eq!(run.exit_code, Some(0));
    }

    #[test]
    fn think_and_unknown_tools() {
        assert_eq!(
            ToolOutput::parse(THINK, &json!("plan first")),
            ToolOutput::Think("plan first".into())
        );
        assert_eq!(
            ToolOutput::parse("grep", &json!({"hits": 3})),
            ToolOutput::Other(json!({"hits": 3}))
        );
    }
}
