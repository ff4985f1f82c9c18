//! ワークフローのツール

use super::extract::extract_params;
use super::model::{TriggerCondition, Workflow, WorkflowStep};
use super::orchestrator::{WorkflowOrchestrator, redact};
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::tools::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolSpec};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use shipflow_core::Classify;
use std::sync::Arc;

/// 実行時にワークフローへ渡さない制御用パラメータ
const CONTROL_PARAMS: &[&str] = &["prompt", "workflow", "dry_run"];

pub struct WorkflowTools {
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl WorkflowTools {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>) -> Self {
        Self { orchestrator }
    }

    fn analyze(&self, params: &Params) -> Result<ToolOutput> {
        let prompt = params.required_str("prompt")?;
        match self.orchestrator.analyze(&prompt) {
            Ok(analysis) => Ok(ToolOutput::ok(json!({
                "selected_workflow": analysis.workflow.name,
                "workflow_description": analysis.workflow.description,
                "score": analysis.score,
                "extracted_parameters": analysis.params.as_map(),
                "workflow_steps": analysis.workflow.steps,
                "confidence_scores": analysis.scores,
            }))),
            Err(e @ EngineError::NoMatch { .. }) => Ok(ToolOutput::outcome(
                json!({
                    "extracted_parameters": extract_params(&prompt).as_map(),
                    "confidence_scores": self.orchestrator.score_all(&prompt),
                }),
                false,
                Some(e.to_failure()),
            )),
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, params: &Params) -> Result<ToolOutput> {
        let prompt = params.required_str("prompt")?;
        let forced = params.str("workflow");
        let analysis = self.orchestrator.select(&prompt, forced.as_deref())?;

        let mut overrides = params.clone();
        for key in CONTROL_PARAMS {
            overrides.remove(key);
        }
        let mut effective = analysis.params.clone();
        effective.merge(&overrides);

        if params.flag("dry_run")? {
            return Ok(ToolOutput::ok(json!({
                "mode": "dry_run",
                "selected_workflow": analysis.workflow.name,
                "workflow_description": analysis.workflow.description,
                "score": analysis.score,
                "confidence_scores": analysis.scores,
                "extracted_parameters": redact(effective.as_map()),
                "steps_to_execute": analysis.workflow.steps,
            })));
        }

        let result = self.orchestrator.execute(&analysis.workflow, &effective).await;
        let (success, error) = (result.success, result.error.clone());
        Ok(ToolOutput::outcome(
            json!({
                "selected_workflow": analysis.workflow.name,
                "score": analysis.score,
                "extracted_parameters": redact(effective.as_map()),
                "execution": result,
            }),
            success,
            error,
        ))
    }

    fn list(&self, params: &Params) -> Result<ToolOutput> {
        let category = params.str("category");
        let workflows = self.orchestrator.list(category.as_deref());
        let entries: Vec<Value> = if params.flag("detailed")? {
            workflows.iter().map(|w| json!(w)).collect()
        } else {
            workflows
                .iter()
                .map(|w| {
                    json!({
                        "name": w.name,
                        "description": w.description,
                        "category": w.category,
                        "keywords": w.keywords,
                        "steps": w.steps.len(),
                    })
                })
                .collect()
        };
        Ok(ToolOutput::ok(json!({
            "count": entries.len(),
            "workflows": entries,
        })))
    }

    fn create(&self, params: &Params) -> Result<ToolOutput> {
        let mut workflow = Workflow::new(
            &params.required_str("name")?,
            &params.str("description").unwrap_or_default(),
            &params.str("category").unwrap_or_default(),
        );
        workflow.keywords = params.list("keywords");
        workflow.steps = json_param::<Vec<WorkflowStep>>(params, "steps")?.unwrap_or_default();
        workflow.trigger_conditions =
            json_param::<Vec<TriggerCondition>>(params, "conditions")?.unwrap_or_default();

        let created = self.orchestrator.create(workflow)?;
        Ok(ToolOutput::ok(created))
    }
}

/// JSON 文字列またはそのままの値を読む
fn json_param<T: DeserializeOwned>(params: &Params, key: &str) -> Result<Option<T>> {
    let value = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| EngineError::invalid(key, e.to_string()))?
        }
        Some(other) => other.clone(),
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| EngineError::invalid(key, e.to_string()))
}

#[async_trait]
impl ToolHandler for WorkflowTools {
    fn specs(&self) -> Vec<ToolSpec> {
        use ParamSpec as P;
        use ParamType as T;
        let prompt = P::required("prompt", T::String, "Natural-language description of the task");
        vec![
            ToolSpec::new(
                "workflow_analyze",
                "Pick the workflow that best matches a prompt and extract its parameters",
                vec![prompt.clone()],
            ),
            ToolSpec::new(
                "workflow_execute",
                "Run the workflow matching a prompt; other parameters override extracted ones",
                vec![
                    prompt,
                    P::optional("workflow", T::String, "Run this workflow instead of the best match"),
                    P::optional("dry_run", T::Boolean, "Only report what would run"),
                ],
            ),
            ToolSpec::new(
                "workflow_list",
                "List registered workflows",
                vec![
                    P::optional("category", T::String, "Filter by category or keyword"),
                    P::optional("detailed", T::Boolean, "Include steps and conditions"),
                ],
            ),
            ToolSpec::new(
                "workflow_create",
                "Register a custom workflow (replaces one with the same name)",
                vec![
                    P::required("name", T::String, "Workflow name (normalized to lower_snake_case)"),
                    P::required("steps", T::List, "Steps as a JSON array of {tool, parameters, on_success, on_failure}"),
                    P::optional("description", T::String, "Description"),
                    P::optional("category", T::String, "Category (default: custom)"),
                    P::optional("keywords", T::List, "Keywords used for matching"),
                    P::optional("conditions", T::List, "JSON array of {type, pattern, required, confidence}"),
                ],
            ),
        ]
    }

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
        match tool {
            "workflow_analyze" => self.analyze(params),
            "workflow_execute" => self.execute(params).await,
            "workflow_list" => self.list(params),
            "workflow_create" => self.create(params),
            other => Err(EngineError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use shipflow_core::ErrorKind;
    use std::sync::Mutex;

    const PROMPT: &str =
        "Build and push my app from https://github.com/acme/widget.git to quay.io/acme/widget:latest";

    /// 組み込みワークフローが使うツールを成功させるだけのハンドラ
    #[derive(Default)]
    struct Stub {
        calls: Mutex<Vec<(String, Params)>>,
    }

    #[async_trait]
    impl ToolHandler for Stub {
        fn specs(&self) -> Vec<ToolSpec> {
            [
                "image_build",
                "image_push",
                "image_inspect",
                "image_list",
                "registry_list",
                "app_deploy",
                "app_list",
            ]
            .into_iter()
            .map(|t| ToolSpec::new(t, "stub", vec![]))
            .collect()
        }

        async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), params.clone()));
            Ok(ToolOutput::ok(json!({})))
        }
    }

    fn setup() -> (Arc<Stub>, ToolRegistry) {
        let stub = Arc::new(Stub::default());
        let mut core = ToolRegistry::new();
        core.register(stub.clone());
        let orchestrator = WorkflowOrchestrator::new(Arc::new(core.clone())).unwrap();
        let mut surface = core;
        surface.register(Arc::new(WorkflowTools::new(Arc::new(orchestrator))));
        (stub, surface)
    }

    fn prompt(extra: &[&str]) -> Params {
        let mut params = Params::from_pairs(extra).unwrap();
        params.insert("prompt", PROMPT);
        params
    }

    #[tokio::test]
    async fn test_analyze() {
        let (_stub, registry) = setup();
        let output = registry.call("workflow_analyze", &prompt(&[])).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["selected_workflow"], "build_and_push");
        assert_eq!(output.data["confidence_scores"]["build_and_push"], 120);
        assert_eq!(output.data["extracted_parameters"]["registry"], "quay.io");

        let mut params = Params::new();
        params.insert("prompt", "hello world");
        let output = registry.call("workflow_analyze", &params).await;
        assert!(!output.success);
        assert_eq!(output.error.unwrap().kind, ErrorKind::NotFound);
        assert_eq!(output.data["confidence_scores"]["security_scan"], -30);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_execute() {
        let (stub, registry) = setup();
        let output = registry
            .call("workflow_execute", &prompt(&["dry_run=true"]))
            .await;
        assert!(output.success);
        assert_eq!(output.data["mode"], "dry_run");
        assert_eq!(output.data["steps_to_execute"][0]["tool"], "image_build");
        assert!(stub.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_with_overrides_and_forced_workflow() {
        let (stub, registry) = setup();
        let output = registry
            .call("workflow_execute", &prompt(&["namespace=demo", "workflow=deploy_application"]))
            .await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["selected_workflow"], "deploy_application");
        assert_eq!(output.data["execution"]["success"], true);
        assert!(output.data["execution"]["duration_ms"].is_u64());
        assert!(output.data["execution"]["step_results"][0]["duration_ms"].is_u64());

        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (tool, params) = &calls[0];
        assert_eq!(tool, "app_deploy");
        assert_eq!(params.str("namespace").as_deref(), Some("demo"));
        assert_eq!(params.str("source_type").as_deref(), Some("git"));
        assert!(!params.has("prompt"));
        assert!(!params.has("workflow"));
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_stub, registry) = setup();
        let mut params = Params::new();
        params.insert("name", "Nightly Cleanup");
        params.insert("category", "maintenance");
        params.insert("keywords", "nightly,cleanup");
        params.insert("steps", r#"[{"tool": "image_list", "parameters": {"filter": "dangling"}}]"#);
        params.insert(
            "conditions",
            json!([{ "type": "keyword", "pattern": "nightly", "required": true, "confidence": 80 }]),
        );
        let output = registry.call("workflow_create", &params).await;
        assert!(output.success, "{:?}", output.error);
        assert_eq!(output.data["name"], "nightly_cleanup");

        let mut filter = Params::new();
        filter.insert("category", "maintenance");
        let output = registry.call("workflow_list", &filter).await;
        assert_eq!(output.data["count"], 1);
        assert_eq!(output.data["workflows"][0]["steps"], 1);

        let output = registry.call("workflow_list", &Params::new()).await;
        assert_eq!(output.data["count"], 6);
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_definitions() {
        let (_stub, registry) = setup();
        let mut params = Params::new();
        params.insert("name", "broken");
        params.insert("steps", "not json");
        let output = registry.call("workflow_create", &params).await;
        assert_eq!(output.error.unwrap().kind, ErrorKind::Validation);

        params.insert("steps", r#"[{"tool": "launch_rockets"}]"#);
        let output = registry.call("workflow_create", &params).await;
        let error = output.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.contains("launch_rockets"));
    }
}
