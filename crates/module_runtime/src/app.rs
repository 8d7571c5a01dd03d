//! Application lifetime context: owns configuration and running modules.

use crate::config::RuntimeConfig;
use crate::error::TaskError;
use crate::module::{Module, Service};
use crate::skeleton::Skeleton;
use crate::task::TaskPool;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct RunningModule {
    name: String,
    close: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Starts modules and shuts them down in reverse start order.
pub struct App {
    config: RuntimeConfig,
    modules: Vec<RunningModule>,
}

impl Default for App {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl App {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            modules: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates a module using the application's module configuration.
    pub fn module<S: Service>(&self, name: &str) -> Module<S> {
        Module::new(name, self.config.module.clone())
    }

    /// Creates a task pool delivering completions to `skeleton`.
    pub fn task_pool<S: 'static>(
        &self,
        name: &str,
        skeleton: Skeleton<S>,
    ) -> Result<TaskPool<S>, TaskError> {
        TaskPool::new(name, &self.config.task_pool, skeleton)
    }

    /// Spawns the module's loop on the tokio runtime.
    pub fn spawn<S: Service>(&mut self, module: Module<S>, state: S) {
        let name = module.name().to_string();
        let (close, close_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            module.run(state, close_rx).await;
        });
        info!(module = %name, "Module spawned");
        self.modules.push(RunningModule { name, close, handle });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Closes modules last-started first, waiting for each loop to finish
    /// before closing the next.
    pub async fn shutdown(mut self) {
        while let Some(module) = self.modules.pop() {
            let RunningModule { name, close, handle } = module;
            let _ = close.send(());
            if let Err(err) = handle.await {
                error!(module = %name, error = %err, "module task ended abnormally");
            }
        }
        info!("All modules stopped");
    }
}
