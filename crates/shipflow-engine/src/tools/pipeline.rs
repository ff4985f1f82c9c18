//! パイプラインのツール

use super::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::pipeline::{Pipeline, PipelineManager, Status};
use crate::tools::git::credentials_from;
use async_trait::async_trait;
use serde_json::json;

pub struct PipelineTools {
    manager: PipelineManager,
}

impl PipelineTools {
    pub fn new(manager: PipelineManager) -> Self {
        Self { manager }
    }

    async fn create(&self, params: &Params) -> Result<ToolOutput> {
        let mut pipeline = Pipeline::new(
            &params.required_str("name")?,
            &params.required_str("git_url")?,
            &params.required_str("image_name")?,
            &params.required_str("deploy_namespace")?,
        );
        if let Some(branch) = params.str("git_branch") {
            pipeline.git_branch = branch;
        }
        if let Some(dockerfile) = params.str("dockerfile") {
            pipeline.dockerfile = dockerfile;
        }
        pipeline.registry = params.str("registry");
        pipeline.build_args = params.map("build_args")?;
        pipeline.env_vars = params.map("env_vars")?;
        pipeline.active = params.bool("active")?.unwrap_or(true);
        pipeline.credentials = credentials_from(params, "git_");

        let created = self.manager.create(pipeline).await?;
        Ok(ToolOutput::ok(created))
    }

    async fn trigger(&self, params: &Params) -> Result<ToolOutput> {
        let name = params.required_str("name")?;
        let handle = self.manager.trigger(&name)?;
        if !params.flag("wait")? {
            return Ok(ToolOutput::ok(json!({
                "pipeline": handle.pipeline(),
                "run_id": handle.run_id(),
                "status": Status::Pending,
            })));
        }

        let run = handle.wait().await;
        let success = run.status == Status::Success;
        let error = run.error.clone();
        Ok(ToolOutput::outcome(run, success, error))
    }
}

#[async_trait]
impl ToolHandler for PipelineTools {
    fn specs(&self) -> Vec<ToolSpec> {
        use ParamSpec as P;
        use ParamType as T;
        let name = P::required("name", T::String, "Pipeline name");
        vec![
            ToolSpec::new(
                "pipeline_create",
                "Create a build, push and deploy pipeline triggered by commits to a repository",
                vec![
                    name.clone(),
                    P::required("git_url", T::String, "Git repository URL"),
                    P::required("image_name", T::String, "Image name without tag"),
                    P::required("deploy_namespace", T::String, "Namespace to deploy into"),
                    P::optional("git_branch", T::String, "Branch to follow (default: main)"),
                    P::optional("registry", T::String, "Registry profile name or registry host"),
                    P::optional("dockerfile", T::String, "Dockerfile path (default: Dockerfile)"),
                    P::optional("build_args", T::Map, "Build arguments"),
                    P::optional("env_vars", T::Map, "Environment variables for the deployment"),
                    P::optional("active", T::Boolean, "Run on new commits (default: true)"),
                    P::optional("git_username", T::String, "Git HTTPS username"),
                    P::optional("git_password", T::String, "Git HTTPS password or token"),
                ],
            ),
            ToolSpec::new("pipeline_list", "List pipelines and their last status", vec![]),
            ToolSpec::new(
                "pipeline_trigger",
                "Run a pipeline now",
                vec![
                    name.clone(),
                    P::optional("wait", T::Boolean, "Wait for the run to finish"),
                ],
            ),
            ToolSpec::new("pipeline_delete", "Delete a pipeline", vec![name]),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        match tool {
            "pipeline_create" => self.create(params).await,
            "pipeline_list" => {
                let pipelines = self.manager.list();
                Ok(ToolOutput::ok(json!({
                    "count": pipelines.len(),
                    "pipelines": pipelines,
                })))
            }
            "pipeline_trigger" => self.trigger(params).await,
            "pipeline_delete" => {
                let name = params.required_str("name")?;
                let deleted = self.manager.delete(&name).await?;
                Ok(ToolOutput::ok(json!({ "name": deleted.name, "deleted": true })))
            }
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}
