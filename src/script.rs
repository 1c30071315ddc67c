//! Provider adapter that shells out to per-hypervisor command-line tools.
//!
//! Exit status contract:
//!
//! | code | outcome           |
//! |------|-------------------|
//! | 0    | Success           |
//! | 3    | Pending           |
//! | 4    | Gone              |
//! | 75   | RetryableError    |
//! | else | FatalError        |
//!
//! Whatever the tool wrote to stderr becomes the error detail. A tool still
//! running when its call is abandoned is killed.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::process::Stdio;

use async_trait::async_trait;
use teardown_reconciler::{
    OperationOutcome, ProviderAdapter, ProviderError, ProviderResult, ResourceId,
};
use tokio::process::Command;
use tracing::debug;

use crate::settings::CommandProviderConfig;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PENDING: i32 = 3;
pub const EXIT_GONE: i32 = 4;
/// `EX_TEMPFAIL` from sysexits.h.
pub const EXIT_TEMPFAIL: i32 = 75;

const ID_PLACEHOLDER: &str = "{id}";

/// Runs configured argument vectors for each provider call.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    config: CommandProviderConfig,
}

impl CommandProvider {
    pub fn new(config: CommandProviderConfig) -> Self {
        Self { config }
    }

    async fn run(&self, call: &str, argv: &[String], id: &ResourceId) -> ProviderResult {
        let Some((program, args)) = argv.split_first() else {
            return Err(ProviderError::other(format!(
                "provider '{}' has no {call} command",
                self.config.name
            )));
        };

        let program = expand(program, id);
        debug!(
            provider = %self.config.name,
            resource_id = %id,
            call,
            program = %program,
            "Running provider command"
        );

        let output = Command::new(&program)
            .args(args.iter().map(|arg| expand(arg, id)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::io(format!("{program}: {e}")))?;

        Ok(outcome_for(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Substitute the resource id into one argument.
pub fn expand(template: &str, id: &ResourceId) -> String {
    template.replace(ID_PLACEHOLDER, id.as_str())
}

/// Map a process exit code to an outcome. `None` means killed by a signal.
pub fn outcome_for(code: Option<i32>, stderr: &str) -> OperationOutcome {
    let detail = |fallback: String| {
        let trimmed = stderr.trim();
        if trimmed.is_empty() {
            fallback
        } else {
            trimmed.to_string()
        }
    };

    match code {
        Some(EXIT_SUCCESS) => OperationOutcome::Success,
        Some(EXIT_PENDING) => OperationOutcome::Pending,
        Some(EXIT_GONE) => OperationOutcome::Gone,
        Some(EXIT_TEMPFAIL) => OperationOutcome::retryable(detail(format!(
            "temporary failure (exit {EXIT_TEMPFAIL})"
        ))),
        Some(other) => OperationOutcome::fatal(detail(format!("exit status {other}"))),
        None => OperationOutcome::retryable(detail("terminated by signal".to_string())),
    }
}

#[async_trait]
impl ProviderAdapter for CommandProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn stop(&self, id: &ResourceId) -> ProviderResult {
        self.run("stop", &self.config.stop, id).await
    }

    async fn shutdown(&self, id: &ResourceId) -> ProviderResult {
        if self.config.shutdown.is_empty() {
            self.stop(id).await
        } else {
            self.run("shutdown", &self.config.shutdown, id).await
        }
    }

    async fn is_stopped(&self, id: &ResourceId) -> ProviderResult {
        self.run("is_stopped", &self.config.is_stopped, id).await
    }

    async fn delete(&self, id: &ResourceId) -> ProviderResult {
        self.run("delete", &self.config.delete, id).await
    }

    async fn is_deleted(&self, id: &ResourceId) -> ProviderResult {
        self.run("is_deleted", &self.config.is_deleted, id).await
    }

    fn must_stop_before_deletion(&self) -> bool {
        self.config.must_stop_before_deletion
    }

    fn prefers_soft_shutdown(&self) -> bool {
        self.config.prefers_soft_shutdown
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn config(name: &str) -> CommandProviderConfig {
        CommandProviderConfig {
            name: name.to_string(),
            stop: Vec::new(),
            shutdown: Vec::new(),
            is_stopped: Vec::new(),
            delete: Vec::new(),
            is_deleted: Vec::new(),
            must_stop_before_deletion: true,
            prefers_soft_shutdown: false,
        }
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(outcome_for(Some(0), ""), OperationOutcome::Success);
        assert_eq!(outcome_for(Some(3), "ignored"), OperationOutcome::Pending);
        assert_eq!(outcome_for(Some(4), ""), OperationOutcome::Gone);
        assert_eq!(
            outcome_for(Some(75), "host busy\n"),
            OperationOutcome::retryable("host busy")
        );
        assert_eq!(
            outcome_for(Some(1), "  no such vm "),
            OperationOutcome::fatal("no such vm")
        );
        assert_eq!(
            outcome_for(Some(2), ""),
            OperationOutcome::fatal("exit status 2")
        );
        assert!(matches!(
            outcome_for(None, ""),
            OperationOutcome::RetryableError(_)
        ));
    }

    #[test]
    fn test_expand_replaces_every_placeholder() {
        let id = ResourceId::new("vm-7");
        assert_eq!(expand("/srv/{id}/{id}.img", &id), "/srv/vm-7/vm-7.img");
        assert_eq!(expand("--force", &id), "--force");
    }

    #[tokio::test]
    async fn test_missing_command_is_provider_error() {
        let provider = CommandProvider::new(config("empty"));
        let result = provider.stop(&ResourceId::new("vm-1")).await;
        assert!(matches!(result, Err(ProviderError::Other(_))));
    }

    #[tokio::test]
    async fn test_unspawnable_program_is_io_error() {
        let mut cfg = config("missing");
        cfg.delete = vec!["/nonexistent/teardown-tool-does-not-exist".to_string()];
        let result = CommandProvider::new(cfg).delete(&ResourceId::new("vm-1")).await;
        assert!(matches!(result, Err(ProviderError::Io(_))));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_commands_through_shell() {
        let mut cfg = config("sh");
        cfg.stop = sh("exit 0");
        cfg.is_stopped = sh("exit 3");
        cfg.delete = sh("echo 'datastore locked' >&2; exit 75");
        cfg.is_deleted = sh("exit 4");
        let provider = CommandProvider::new(cfg);
        let id = ResourceId::new("vm-1");

        assert_eq!(provider.stop(&id).await.unwrap(), OperationOutcome::Success);
        assert_eq!(provider.is_stopped(&id).await.unwrap(), OperationOutcome::Pending);
        assert_eq!(
            provider.delete(&id).await.unwrap(),
            OperationOutcome::retryable("datastore locked")
        );
        assert_eq!(provider.is_deleted(&id).await.unwrap(), OperationOutcome::Gone);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_id_reaches_the_command() {
        let mut cfg = config("sh");
        cfg.stop = sh("test \"$0\" = vm-9 || exit 1");
        cfg.stop.push("{id}".to_string());
        let provider = CommandProvider::new(cfg);

        assert_eq!(
            provider.stop(&ResourceId::new("vm-9")).await.unwrap(),
            OperationOutcome::Success
        );
        assert!(provider.stop(&ResourceId::new("vm-8")).await.unwrap().is_error());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_falls_back_to_stop() {
        let mut cfg = config("sh");
        cfg.stop = sh("exit 3");
        let provider = CommandProvider::new(cfg.clone());
        assert_eq!(
            provider.shutdown(&ResourceId::new("vm-1")).await.unwrap(),
            OperationOutcome::Pending
        );

        cfg.shutdown = sh("exit 0");
        let provider = CommandProvider::new(cfg);
        assert_eq!(
            provider.shutdown(&ResourceId::new("vm-1")).await.unwrap(),
            OperationOutcome::Success
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_call_kills_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let mut cfg = config("sh");
        cfg.stop = sh(&format!("sleep 1 && touch '{}'", marker.display()));
        let provider = CommandProvider::new(cfg);

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            provider.stop(&ResourceId::new("vm-1")),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
