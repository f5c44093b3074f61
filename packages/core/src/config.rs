//! # Orchestrator
//!
//! [`Configurator`] owns the published [`Snapshot`] and runs every pipeline
//! pass against a private clone of it:
//!
//! ```text
//!            ┌──────── lock held for the whole run ────────┐
//! snapshot ─→ clone ─→ pull ─→ [edit + commit] ─→ render ─→ write ─→ publish ─→ reload
//!                                                                      │
//!                                              last render only moves ─┘ after reload
//! ```
//!
//! Any failure drops the clone, so readers only ever see the state before
//! the run or the fully rendered state after it.

use crate::builtins::builtin_directives;
use crate::directives::{DirectiveEngine, DirectiveTable};
use crate::error::{ConfigError, ConfigResult};
use crate::exec::CommandRunner;
use crate::pipeline::RenderPipeline;
use crate::settings::PipelineSettings;
use crate::snapshot::Snapshot;
use crate::store::{CommitOperation, ConfigStore, UpdateHandle, UpdateTrigger};
use async_trait::async_trait;
use configurator_document::{DocumentResult, JsonTree, Value};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Configurator {
    me: Weak<Configurator>,
    store: Arc<dyn ConfigStore>,
    pipeline: RenderPipeline,
    handle: UpdateHandle,
    /// Serializes pull, update and mutate
    lock: Mutex<()>,
    state: RwLock<Snapshot>,
}

pub struct ConfiguratorBuilder {
    store: Arc<dyn ConfigStore>,
    settings: PipelineSettings,
    runner: Option<Arc<dyn CommandRunner>>,
    directives: DirectiveTable,
}

impl ConfiguratorBuilder {
    /// Run commands with `runner` instead of a shell
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Extra directive handlers, registered after the built-in lookups
    pub fn directives(mut self, directives: DirectiveTable) -> Self {
        self.directives.extend(directives);
        self
    }

    pub fn build(self) -> ConfigResult<Arc<Configurator>> {
        let Self {
            store,
            settings,
            runner,
            directives,
        } = self;
        settings.check()?;

        let runner =
            runner.unwrap_or_else(|| Arc::new(RenderPipeline::shell_runner(&settings)));

        Ok(Arc::new_cyclic(|me: &Weak<Configurator>| {
            let trigger: Weak<dyn UpdateTrigger> = me.clone();
            let handle = UpdateHandle::new(trigger);

            let mut table = builtin_directives(Arc::clone(&store), handle.clone());
            table.extend(directives);

            Configurator {
                me: me.clone(),
                store,
                pipeline: RenderPipeline::new(settings, runner, DirectiveEngine::new(table)),
                handle,
                lock: Mutex::new(()),
                state: RwLock::new(Snapshot::default()),
            }
        }))
    }
}

impl Configurator {
    pub fn builder(store: Arc<dyn ConfigStore>, settings: PipelineSettings) -> ConfiguratorBuilder {
        ConfiguratorBuilder {
            store,
            settings,
            runner: None,
            directives: DirectiveTable::new(),
        }
    }

    /// Orchestrator running commands through the configured shell
    pub fn new(store: Arc<dyn ConfigStore>, settings: PipelineSettings) -> ConfigResult<Arc<Self>> {
        Self::builder(store, settings).build()
    }

    pub fn settings(&self) -> &PipelineSettings {
        self.pipeline.settings()
    }

    pub fn update_handle(&self) -> UpdateHandle {
        self.handle.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read_state().clone()
    }

    pub fn document(&self) -> JsonTree {
        self.read_state().document.clone()
    }

    /// Value at `path`, with scalars wrapped in a one-element array
    pub fn get(&self, path: &str) -> Value {
        self.read_state().document.get_wrapped(path)
    }

    /// Last artifact that was written and reloaded successfully
    pub fn last_render(&self) -> Vec<u8> {
        self.read_state().rendered.clone()
    }

    pub fn version(&self) -> u64 {
        self.read_state().version
    }

    /// Replace the published document with the store's, without rendering
    pub async fn pull(&self) -> ConfigResult<bool> {
        let _guard = self.lock.lock().await;

        let mut next = self.snapshot();
        let changed = self.store.pull(&self.handle, &mut next).await?;

        let mut state = self.write_state();
        state.document = next.document;
        state.version = next.version;
        Ok(changed)
    }

    /// Check that the published document renders, without writing anything
    pub async fn validate(&self) -> ConfigResult<()> {
        let document = self.document();
        self.pipeline.render_and_validate(&document).await?;
        Ok(())
    }

    /// Render an arbitrary document without publishing or writing it
    pub async fn preview(&self, document: &JsonTree) -> ConfigResult<Vec<u8>> {
        self.pipeline.render_and_validate(document).await
    }

    /// Pull the latest document, render it and deploy the result
    pub async fn update(&self) -> ConfigResult<()> {
        let _guard = self.lock.lock().await;

        let mut next = self.snapshot();
        let changed = self.store.pull(&self.handle, &mut next).await?;
        debug!(changed, version = next.version, "pulled configuration");

        let rendered = self.pipeline.render_and_validate(&next.document).await?;
        self.apply_and_reload(next, rendered).await
    }

    /// Apply `edit` to the latest document, commit it and deploy the result
    ///
    /// The edit may run more than once if other writers race the commit.
    /// Nothing is committed unless the edited document renders.
    pub async fn mutate<F>(&self, edit: F) -> ConfigResult<()>
    where
        F: FnMut(&mut JsonTree) -> DocumentResult<()> + Send,
    {
        let _guard = self.lock.lock().await;

        let mut next = self.snapshot();
        self.store.pull(&self.handle, &mut next).await?;
        self.pipeline.render_and_validate(&next.document).await?;

        let mut operation = EditOperation {
            edit,
            pipeline: &self.pipeline,
        };
        self.store
            .commit(&self.handle, &mut next, &mut operation)
            .await?;

        let rendered = std::mem::take(&mut next.rendered);
        self.apply_and_reload(next, rendered).await
    }

    async fn apply_and_reload(&self, next: Snapshot, rendered: Vec<u8>) -> ConfigResult<()> {
        self.pipeline.persist(&rendered).await?;

        {
            let mut state = self.write_state();
            state.document = next.document;
            state.version = next.version;
        }
        info!(
            target = %self.settings().target.display(),
            version = next.version,
            "published configuration"
        );

        self.pipeline.reload().await?;
        self.write_state().rendered = rendered;
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UpdateTrigger for Configurator {
    fn trigger_update(&self, source: &str) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let source = source.to_string();
        tokio::spawn(async move {
            info!(source = %source, "update triggered");
            match me.update().await {
                Ok(()) => info!(source = %source, "update successful"),
                Err(err) => warn!(source = %source, error = %err, "update failed, ignoring"),
            }
        });
    }
}

/// Applies a caller's edit and renders the result inside a commit attempt
struct EditOperation<'a, F> {
    edit: F,
    pipeline: &'a RenderPipeline,
}

#[async_trait]
impl<F> CommitOperation for EditOperation<'_, F>
where
    F: FnMut(&mut JsonTree) -> DocumentResult<()> + Send,
{
    async fn apply(&mut self, snapshot: &mut Snapshot) -> ConfigResult<()> {
        (self.edit)(&mut snapshot.document).map_err(ConfigError::MutationRejected)?;
        snapshot.rendered = self
            .pipeline
            .render_and_validate(&snapshot.document)
            .await?;
        Ok(())
    }
}
