//! Helpers for collaborators that are driven through external command line tools.
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use serde::de::DeserializeOwned;
use tokio::process::Command;

pub fn create_command(arguments: &[String]) -> anyhow::Result<Command> {
    let (program, args) = arguments
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Empty command"))?;
    let mut command = Command::new(program);
    command.args(args);
    command.kill_on_drop(true);
    Ok(command)
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs the command and returns its trimmed standard output.
pub async fn run_command(arguments: &[String]) -> anyhow::Result<String> {
    let program = arguments.first().cloned().unwrap_or_default();
    log::debug!("Running command `{}`", arguments.join(" "));
    let output = create_command(arguments)?
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?;
    Ok(stdout.trim().to_string())
}

pub async fn run_json_command<T: DeserializeOwned>(arguments: &[String]) -> anyhow::Result<T> {
    let stdout = run_command(arguments).await?;
    serde_json::from_str(&stdout).with_context(|| {
        format!(
            "Cannot parse output of `{}`",
            arguments.first().map(|s| s.as_str()).unwrap_or_default()
        )
    })
}

/// Returns true if the error chain mentions the given error code of the remote API.
pub fn error_has_code(error: &anyhow::Error, code: &str) -> bool {
    error.chain().any(|cause| cause.to_string().contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn capture_stdout() {
        let output = run_command(&args(&["echo", " hello "])).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn parse_json_stdout() {
        #[derive(serde::Deserialize)]
        struct Reply {
            value: u32,
        }
        let reply: Reply = run_json_command(&args(&["echo", r#"{"value": 7}"#]))
            .await
            .unwrap();
        assert_eq!(reply.value, 7);
    }

    #[tokio::test]
    async fn report_stderr_of_failed_command() {
        let error = run_command(&args(&[
            "sh",
            "-c",
            "echo 'An error occurred (InvalidInstanceID.NotFound)' >&2; exit 254",
        ]))
        .await
        .unwrap_err();
        assert!(error_has_code(&error, "InvalidInstanceID.NotFound"));
        assert!(!error_has_code(&error, "UnauthorizedOperation"));
    }

    #[test]
    fn empty_command() {
        assert!(create_command(&[]).is_err());
    }
}
