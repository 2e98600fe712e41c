//! External handler invocation.
//!
//! Handlers are independent executables invoked with the configured base
//! arguments plus `(op_type, operation_id)`. They report outcome through
//! their exit code; on success the last non-empty stdout line is the result
//! side channel (handlers never write operation status themselves — the
//! orchestrator owns every transition).

use std::path::PathBuf;

use thiserror::Error;
use tokio::process::Command;

use hostpilot_core::OperationId;

use crate::registry::HandlerCommand;

/// Captured output is bounded so a chatty handler cannot bloat the store.
const OUTPUT_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone, Error)]
pub enum HandlerFailure {
    /// No mapping for the operation type. Terminal, never retried.
    #[error("no handler configured")]
    NoHandler,
    /// The mapped program is missing or not runnable. Terminal, never retried.
    #[error("handler unavailable: {0}")]
    Unavailable(String),
    /// The handler ran and reported failure. Enters the bounded-retry path.
    #[error("handler exited with status {exit}: {output}")]
    Failed { exit: i32, output: String },
    /// Spawn/wait plumbing failed mid-flight. Enters the bounded-retry path.
    #[error("handler io error: {0}")]
    Io(String),
}

impl HandlerFailure {
    /// Whether the failure may be given another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerFailure::Failed { .. } | HandlerFailure::Io(_))
    }

    /// Note recorded in the operation's `error` field on reset.
    pub fn retry_note(&self) -> String {
        match self {
            HandlerFailure::Failed { output, .. } if !output.is_empty() => output.clone(),
            other => other.to_string(),
        }
    }
}

/// Run a handler to completion and derive its result.
pub async fn invoke(
    command: &HandlerCommand,
    op_type: &str,
    id: OperationId,
) -> Result<serde_json::Value, HandlerFailure> {
    let program = resolve_program(command)?;

    let output = Command::new(&program)
        .args(&command.base_args)
        .arg(op_type)
        .arg(id.to_string())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                HandlerFailure::Unavailable(format!("{}: {e}", program.display()))
            }
            _ => HandlerFailure::Io(e.to_string()),
        })?;

    if output.status.success() {
        Ok(result_from_stdout(&output.stdout))
    } else {
        Err(HandlerFailure::Failed {
            exit: output.status.code().unwrap_or(-1),
            output: output_tail(&output.stdout, &output.stderr),
        })
    }
}

/// Resolve the configured program to something spawnable.
///
/// Bare names go through PATH lookup; anything with a directory component
/// must exist as a file.
fn resolve_program(command: &HandlerCommand) -> Result<PathBuf, HandlerFailure> {
    let has_dir = command
        .program
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty());

    if has_dir {
        match std::fs::metadata(&command.program) {
            Ok(meta) if meta.is_file() => Ok(command.program.clone()),
            Ok(_) => Err(HandlerFailure::Unavailable(format!(
                "{}: not a regular file",
                command.program.display()
            ))),
            Err(e) => Err(HandlerFailure::Unavailable(format!(
                "{}: {e}",
                command.program.display()
            ))),
        }
    } else {
        which::which(&command.program).map_err(|e| {
            HandlerFailure::Unavailable(format!("{}: {e}", command.program.display()))
        })
    }
}

/// Result side channel: the last non-empty stdout line, parsed as JSON when
/// possible. `completed` operations therefore always carry a non-null result.
fn result_from_stdout(stdout: &[u8]) -> serde_json::Value {
    let last_line = String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_default();

    serde_json::from_str(&last_line)
        .unwrap_or_else(|_| serde_json::json!({ "output": last_line }))
}

fn output_tail(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::new();
    for chunk in [stderr, stdout] {
        let text = String::from_utf8_lossy(chunk);
        let text = text.trim();
        if !text.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(text);
        }
    }
    if combined.len() > OUTPUT_TAIL_BYTES {
        let cut = combined
            .char_indices()
            .rev()
            .find(|(i, _)| combined.len() - i >= OUTPUT_TAIL_BYTES)
            .map(|(i, _)| i)
            .unwrap_or(0);
        combined.split_off(cut)
    } else {
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_prefers_json_last_line() {
        let value = result_from_stdout(b"provisioning...\n{\"site_id\": 42}\n");
        assert_eq!(value, serde_json::json!({"site_id": 42}));
    }

    #[test]
    fn result_wraps_plain_text() {
        let value = result_from_stdout(b"site created\n");
        assert_eq!(value, serde_json::json!({"output": "site created"}));
    }

    #[test]
    fn result_of_silent_handler_is_non_null() {
        let value = result_from_stdout(b"");
        assert_eq!(value, serde_json::json!({"output": ""}));
    }

    #[test]
    fn output_tail_is_bounded() {
        let long = vec![b'x'; 10_000];
        let tail = output_tail(&long, b"error line");
        assert!(tail.len() <= OUTPUT_TAIL_BYTES);
        assert!(tail.contains('x'));
    }

    #[cfg(unix)]
    mod process {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        use super::super::*;

        fn write_script(dir: &Path, name: &str, body: &str) -> HandlerCommand {
            let path = dir.join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            HandlerCommand::new(path)
        }

        #[tokio::test]
        async fn successful_handler_yields_result() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(
                dir.path(),
                "ok.sh",
                r#"echo "{\"handled\": \"$1\", \"operation\": \"$2\"}""#,
            );

            let id = OperationId::new();
            let result = invoke(&cmd, "site.create", id).await.unwrap();
            assert_eq!(result["handled"], "site.create");
            assert_eq!(result["operation"], id.to_string());
        }

        #[tokio::test]
        async fn base_args_precede_operation_args() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(dir.path(), "args.sh", r#"echo "$1 $2 $3""#)
                .with_args(["create"]);

            let id = OperationId::new();
            let result = invoke(&cmd, "site.create", id).await.unwrap();
            assert_eq!(
                result["output"],
                format!("create site.create {id}")
            );
        }

        #[tokio::test]
        async fn failing_handler_captures_output() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = write_script(
                dir.path(),
                "fail.sh",
                "echo \"partial progress\"\necho \"disk full\" >&2\nexit 3",
            );

            let err = invoke(&cmd, "site.create", OperationId::new())
                .await
                .unwrap_err();
            match err {
                HandlerFailure::Failed { exit, output } => {
                    assert_eq!(exit, 3);
                    assert!(output.contains("disk full"));
                    assert!(output.contains("partial progress"));
                }
                other => panic!("expected Failed, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn missing_program_is_unavailable() {
            let cmd = HandlerCommand::new("/nonexistent/handler.sh");
            let err = invoke(&cmd, "site.create", OperationId::new())
                .await
                .unwrap_err();
            assert!(matches!(err, HandlerFailure::Unavailable(_)));
            assert!(!err.is_retriable());

            let bare = HandlerCommand::new("hostpilot-no-such-handler");
            let err = invoke(&bare, "site.create", OperationId::new())
                .await
                .unwrap_err();
            assert!(matches!(err, HandlerFailure::Unavailable(_)));
        }
    }
}
