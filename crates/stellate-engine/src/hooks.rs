//! Pre- and post-run hooks

use std::fmt;
use std::process::Stdio;

use stellate_core::{HookError, HookSpec};

/// When a hook runs relative to a fact run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Pre,
    Post,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Run a hook command and wait for it
///
/// The command inherits stderr and gets the fact name in `STELLATE_FACT`.
/// Its stdout is logged at debug level and returned. Any non-zero exit
/// fails the run.
pub async fn run_hook(stage: HookStage, hook: &HookSpec, fact: &str) -> Result<String, HookError> {
    tracing::info!(stage = %stage, command = %hook.command, fact, "Running hook");

    let output = tokio::process::Command::new(&hook.command)
        .args(&hook.args)
        .env("STELLATE_FACT", fact)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await
        .map_err(|e| HookError::Spawn {
            stage: stage.to_string(),
            command: hook.command.clone(),
            message: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        tracing::debug!(stage = %stage, command = %hook.command, "{}", line);
    }

    if output.status.success() {
        Ok(stdout)
    } else {
        Err(HookError::Failed {
            stage: stage.to_string(),
            command: hook.command.clone(),
            status: output.status.code(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn hook(command: &str, args: &[&str]) -> HookSpec {
        HookSpec {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn successful_hook() {
        run_hook(HookStage::Pre, &hook("true", &[]), "fact_sales")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_hook_reports_status() {
        let err = run_hook(HookStage::Post, &hook("sh", &["-c", "exit 3"]), "fact_sales")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HookError::Failed {
                stage: "post".into(),
                command: "sh".into(),
                status: Some(3),
            }
        );
    }

    #[tokio::test]
    async fn hook_sees_fact_name() {
        let check = hook("sh", &["-c", "test \"$STELLATE_FACT\" = fact_sales"]);
        run_hook(HookStage::Pre, &check, "fact_sales").await.unwrap();
        assert!(run_hook(HookStage::Pre, &check, "fact_returns").await.is_err());
    }

    #[tokio::test]
    async fn hook_output_is_captured() {
        let echo = hook("sh", &["-c", "echo \"loading $STELLATE_FACT\""]);
        let stdout = run_hook(HookStage::Post, &echo, "fact_sales").await.unwrap();
        assert_eq!(stdout.trim(), "loading fact_sales");
    }

    #[tokio::test]
    async fn missing_command() {
        let err = run_hook(HookStage::Pre, &hook("/nonexistent/stellate-hook", &[]), "f")
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Spawn { .. }));
    }
}
