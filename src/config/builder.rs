//! Workflow builder from YAML configuration.
//!
//! Converts a [`WorkflowConfig`] into a [`Workflow`], resolving defaults and
//! layering environments.

use std::path::Path;
use std::time::Duration;

use crate::core::environment::Environment;
use crate::core::retry::RetryPolicy;
use crate::core::task::{SessionTarget, TaskSpec};
use crate::core::workflow::Workflow;

use super::error::ConfigError;
use super::yaml::{DefaultsConfig, EngineConfig, TaskConfig, WorkflowConfig, YamlLoader};

/// Builder for creating Workflows from YAML configuration.
pub struct WorkflowConfigBuilder;

impl WorkflowConfigBuilder {
    /// Build a Workflow from a WorkflowConfig.
    ///
    /// The result is not validated as a graph; call [`Workflow::validate`].
    pub fn build(config: WorkflowConfig, engine: &EngineConfig) -> Result<Workflow, ConfigError> {
        let base_env = Environment::from_map(engine.environment.clone())
            .layered(&Environment::from_map(config.env.clone()));

        let tasks = config
            .tasks
            .iter()
            .map(|task| Self::build_task(task, &config.defaults, &base_env, engine))
            .collect::<Vec<_>>();

        let mut workflow = Workflow::new(&config.name, tasks)?;

        if let Some(version) = config.version {
            workflow = workflow.with_version(version);
        }

        if let Some(max) = config.max_parallel {
            workflow = workflow.with_max_parallel(max);
        }

        Ok(workflow)
    }

    /// Build a TaskSpec from TaskConfig.
    fn build_task(
        config: &TaskConfig,
        defaults: &DefaultsConfig,
        base_env: &Environment,
        engine: &EngineConfig,
    ) -> TaskSpec {
        let timeout = config
            .timeout
            .or(defaults.timeout)
            .map(Duration::from_secs)
            .unwrap_or_else(|| engine.default_timeout());

        let session = config
            .session
            .as_deref()
            .or(defaults.session.as_deref())
            .map(SessionTarget::parse)
            .unwrap_or_default();

        let retries = config.retries.or(defaults.retries).unwrap_or(0);
        let retry = match config.retry_delay {
            Some(secs) if secs > 0 => RetryPolicy::fixed(retries, Duration::from_secs(secs)),
            _ => RetryPolicy::immediate(retries),
        };

        let env = base_env.layered(&Environment::from_map(config.env.clone()));

        let mut builder = TaskSpec::builder(config.id.as_str(), config.command.as_str())
            .depends_on_all(config.depends_on.iter().map(String::as_str))
            .session(session)
            .timeout(timeout)
            .retry_policy(retry)
            .environment(env);

        if let Some(target) = &config.on_success {
            builder = builder.on_success(target.as_str());
        }
        if let Some(target) = &config.on_failure {
            builder = builder.on_failure(target.as_str());
        }

        builder.build()
    }
}

/// Load and build a workflow definition file.
pub fn load_workflow(
    path: impl AsRef<Path>,
    engine: &EngineConfig,
) -> Result<Workflow, ConfigError> {
    let config = YamlLoader::load_workflow_config(path)?;
    WorkflowConfigBuilder::build(config, engine)
}

/// Parse and build a workflow definition from a YAML string.
pub fn parse_workflow(yaml: &str, engine: &EngineConfig) -> Result<Workflow, ConfigError> {
    let config = YamlLoader::parse_workflow_config(yaml)?;
    WorkflowConfigBuilder::build(config, engine)
}
