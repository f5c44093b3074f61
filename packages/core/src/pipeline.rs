//! # Render Pipeline
//!
//! ```text
//! document ─→ expand directives ─→ transform ─→ validate ─→ write ─→ reload
//!             (throwaway copy)     (stdin→stdout) ($FILE)   (atomic)
//! ```
//!
//! Each stage short-circuits the rest on failure. Rendering and persisting
//! are separate calls so the orchestrator can decide what to publish in
//! between.

use crate::directives::DirectiveEngine;
use crate::error::{ConfigError, ConfigResult};
use crate::exec::{CommandOutput, CommandRunner, ExecError, Invocation, ShellRunner, Stage};
use crate::fs::{stage_temp, write_atomic};
use crate::settings::PipelineSettings;
use configurator_document::JsonTree;
use std::sync::Arc;
use tracing::debug;

pub struct RenderPipeline {
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
    directives: DirectiveEngine,
}

impl RenderPipeline {
    pub fn new(
        settings: PipelineSettings,
        runner: Arc<dyn CommandRunner>,
        directives: DirectiveEngine,
    ) -> Self {
        Self {
            settings,
            runner,
            directives,
        }
    }

    /// The runner the settings ask for: the configured shell, else `$SHELL`
    pub fn shell_runner(settings: &PipelineSettings) -> ShellRunner {
        match settings.shell.as_deref().filter(|shell| !shell.is_empty()) {
            Some(shell) => ShellRunner::new(shell, settings.command_timeout()),
            None => ShellRunner::from_env(settings.command_timeout()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn directives(&self) -> &DirectiveEngine {
        &self.directives
    }

    /// Expand, transform and validate `document` into a candidate artifact
    pub async fn render_and_validate(&self, document: &JsonTree) -> ConfigResult<Vec<u8>> {
        let expanded = self.directives.process(document).await.dump();

        debug!(command = %self.settings.transform, "running transform");
        let transform = Invocation::new(self.settings.transform.as_str()).stdin(expanded.clone());
        let candidate = self.run(Stage::Transform, &transform, &expanded).await?.stdout;

        if let Some(validate) = self.settings.validate_command() {
            let staged = stage_temp(&candidate)
                .map_err(|err| ExecError::not_run(Stage::Validate, err, &candidate))?;
            let file = staged.path().to_string_lossy().into_owned();

            debug!(command = %validate, file = %file, "running validate");
            let invocation = Invocation::new(validate).env("FILE", file);
            self.run(Stage::Validate, &invocation, &candidate).await?;
        }

        Ok(candidate)
    }

    /// Write `bytes` over the target file
    pub async fn persist(&self, bytes: &[u8]) -> ConfigResult<()> {
        let target = &self.settings.target;
        debug!(target = %target.display(), bytes = bytes.len(), "writing artifact");
        write_atomic(target, bytes.to_vec())
            .await
            .map_err(|source| ConfigError::Persist {
                path: target.clone(),
                source,
            })
    }

    /// Run the reload command, if there is one
    pub async fn reload(&self) -> ConfigResult<()> {
        if let Some(reload) = self.settings.reload_command() {
            debug!(command = %reload, "running reload");
            self.run(Stage::Reload, &Invocation::new(reload), &[]).await?;
        }
        Ok(())
    }

    async fn run(
        &self,
        stage: Stage,
        invocation: &Invocation,
        input: &[u8],
    ) -> Result<CommandOutput, ExecError> {
        let output = self
            .runner
            .run(invocation)
            .await
            .map_err(|err| ExecError::not_run(stage, err, input))?;
        if !output.success() {
            return Err(ExecError::exited(stage, &output, input));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::DirectiveTable;
    use serde_json::json;
    use std::time::Duration;

    fn pipeline(settings: PipelineSettings) -> RenderPipeline {
        let mut table = DirectiveTable::new();
        table.register_fn("$value", |_| json!("expanded"));
        let runner = Arc::new(ShellRunner::new("/bin/sh", Duration::from_secs(10)));
        RenderPipeline::new(settings, runner, DirectiveEngine::new(table))
    }

    fn exec_error(err: ConfigError) -> ExecError {
        match err {
            ConfigError::Exec(err) => err,
            other => panic!("expected exec error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_transform_sees_expanded_document() {
        let pipeline = pipeline(PipelineSettings::new("/unused", "cat"));
        let document = JsonTree::from_value(json!({"x": {"$value": "/one"}, "y": 1}));

        let rendered = pipeline.render_and_validate(&document).await.unwrap();
        let rendered: serde_json::Value = serde_json::from_slice(&rendered).unwrap();
        assert_eq!(rendered, json!({"x": "expanded", "y": 1}));
    }

    #[tokio::test]
    async fn test_transform_failure_carries_input() {
        let pipeline = pipeline(PipelineSettings::new("/unused", "echo bad >&2; exit 4"));
        let document = JsonTree::from_value(json!({"x": {"$value": "/one"}}));

        let err = exec_error(pipeline.render_and_validate(&document).await.unwrap_err());
        assert_eq!(err.stage, Stage::Transform);
        assert_eq!(err.stderr, "bad\n");
        assert!(err.input.contains("expanded"));
    }

    #[tokio::test]
    async fn test_validate_reads_candidate_from_file() {
        let settings = PipelineSettings::new("/unused", "printf 'listen 80'")
            .with_validate("grep -q 'listen 80' \"$FILE\"");
        let rendered = pipeline(settings)
            .render_and_validate(&JsonTree::new())
            .await
            .unwrap();
        assert_eq!(rendered, b"listen 80");
    }

    #[tokio::test]
    async fn test_validate_failure_carries_candidate() {
        let settings = PipelineSettings::new("/unused", "printf 'listen 0'")
            .with_validate("echo 'invalid port'; exit 1");

        let err = exec_error(
            pipeline(settings)
                .render_and_validate(&JsonTree::new())
                .await
                .unwrap_err(),
        );
        assert_eq!(err.stage, Stage::Validate);
        assert_eq!(err.input, "listen 0");
        assert_eq!(err.output(), "invalid port\n");
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.cfg");
        let marker = dir.path().join("reloaded");
        let settings = PipelineSettings::new(&target, "cat")
            .with_reload(format!("touch '{}'", marker.display()));
        let pipeline = pipeline(settings);

        pipeline.persist(b"artifact").await.unwrap();
        pipeline.reload().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"artifact");
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_persist_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("out.cfg");
        let err = pipeline(PipelineSettings::new(&target, "cat"))
            .persist(b"artifact")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Persist { path, .. } if path == target));
    }

    #[tokio::test]
    async fn test_reload_failure() {
        let settings = PipelineSettings::new("/unused", "cat").with_reload("exit 1");
        let err = exec_error(pipeline(settings).reload().await.unwrap_err());
        assert_eq!(err.stage, Stage::Reload);
        assert!(err.input.is_empty());
    }

    #[tokio::test]
    async fn test_blank_optional_commands_are_skipped() {
        let settings = PipelineSettings::new("/unused", "cat")
            .with_validate("  ")
            .with_reload("");
        let pipeline = pipeline(settings);
        assert!(pipeline.render_and_validate(&JsonTree::new()).await.is_ok());
        assert!(pipeline.reload().await.is_ok());
    }
}
