//! Runtime backends
//!
//! - [`ShellRuntime`]: local child processes
//! - [`DockerRuntime`]: containers via the `docker` CLI

pub mod docker;
pub mod process;
pub mod shell;

use std::sync::Arc;

use orchestrator_core::{config::RuntimeType, config::WorkerConfig, traits::Runtime};

pub use docker::DockerRuntime;
pub use process::ProcessTable;
pub use shell::ShellRuntime;

/// Builds the runtime selected by the worker configuration.
pub fn create_runtime(config: &WorkerConfig) -> Arc<dyn Runtime> {
    match config.runtime {
        RuntimeType::Shell => match &config.temp_dir {
            Some(dir) => Arc::new(ShellRuntime::with_temp_dir(dir)),
            None => Arc::new(ShellRuntime::new()),
        },
        RuntimeType::Docker => {
            let runtime = DockerRuntime::new();
            match &config.temp_dir {
                Some(dir) => Arc::new(runtime.with_temp_dir(dir)),
                None => Arc::new(runtime),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_runtime_follows_config() {
        let mut config = WorkerConfig::default();
        assert_eq!(create_runtime(&config).name(), "shell");
        config.runtime = RuntimeType::Docker;
        assert_eq!(create_runtime(&config).name(), "docker");
    }
}
