//! ワークフローの選択と実行

use super::builtin::builtin_workflows;
use super::classifier::{IntentClassifier, KeywordClassifier};
use super::extract::extract_params;
use super::model::{
    Branch, ConditionKind, StepResult, Workflow, WorkflowResult, WorkflowStep,
};
use crate::error::{EngineError, Result};
use crate::params::Params;
use crate::tools::ToolRegistry;
use regex::Regex;
use serde_json::{Map, Value};
use shipflow_core::{ErrorKind, Failure, millis};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// これ未満のスコアでは選択しない
pub const MIN_SCORE: i32 = 50;

/// プロンプトの解析結果
#[derive(Debug, Clone)]
pub struct Analysis {
    pub workflow: Workflow,
    pub score: i32,
    /// 全ワークフローのスコア（名前順）
    pub scores: BTreeMap<String, i32>,
    pub params: Params,
}

/// ステップ列の実行結果。失敗した場合は (ツール名, エラー) を持つ
struct StepsOutcome {
    results: Vec<StepResult>,
    failure: Option<(String, Failure)>,
}

type StepsFuture<'a> = Pin<Box<dyn Future<Output = StepsOutcome> + Send + 'a>>;

pub struct WorkflowOrchestrator {
    workflows: RwLock<BTreeMap<String, Workflow>>,
    classifier: Box<dyn IntentClassifier>,
    tools: Arc<ToolRegistry>,
}

impl WorkflowOrchestrator {
    /// 組み込みワークフローを登録した状態で作成する
    ///
    /// 組み込みが参照するツールが `tools` に無い場合はエラー。
    pub fn new(tools: Arc<ToolRegistry>) -> Result<Self> {
        Self::with_classifier(tools, Box::new(KeywordClassifier))
    }

    pub fn with_classifier(
        tools: Arc<ToolRegistry>,
        classifier: Box<dyn IntentClassifier>,
    ) -> Result<Self> {
        let orchestrator = Self {
            workflows: RwLock::new(BTreeMap::new()),
            classifier,
            tools,
        };
        for workflow in builtin_workflows() {
            orchestrator.validate(&workflow)?;
            orchestrator
                .workflows_mut()
                .insert(workflow.name.clone(), workflow);
        }
        Ok(orchestrator)
    }

    fn workflows(&self) -> RwLockReadGuard<'_, BTreeMap<String, Workflow>> {
        self.workflows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn workflows_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Workflow>> {
        self.workflows.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // 選択
    // ========================================================================

    pub fn score_all(&self, prompt: &str) -> BTreeMap<String, i32> {
        let prompt = prompt.to_lowercase();
        self.workflows()
            .values()
            .map(|w| (w.name.clone(), self.classifier.score(&prompt, w)))
            .collect()
    }

    /// 最もスコアの高いワークフローを選ぶ（同点は名前順で先のもの）
    pub fn analyze(&self, prompt: &str) -> Result<Analysis> {
        self.select(prompt, None)
    }

    /// `forced` が指定されていれば採点に関係なくそのワークフローを使う
    pub fn select(&self, prompt: &str, forced: Option<&str>) -> Result<Analysis> {
        let scores = self.score_all(prompt);
        let params = extract_params(prompt);

        if let Some(name) = forced {
            let workflow = self.get(name)?;
            let score = scores.get(&workflow.name).copied().unwrap_or_default();
            return Ok(Analysis {
                workflow,
                score,
                scores,
                params,
            });
        }

        let mut best: Option<(&String, i32)> = None;
        for (name, &score) in &scores {
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((name, score));
            }
        }
        let Some((name, score)) = best else {
            return Err(EngineError::NoMatch { best_score: 0 });
        };
        if score < MIN_SCORE {
            tracing::debug!("No workflow matched (best {} = {})", name, score);
            return Err(EngineError::NoMatch { best_score: score });
        }

        let workflow = self.get(name)?;
        tracing::info!("Selected workflow {} (score {})", workflow.name, score);
        Ok(Analysis {
            workflow,
            score,
            scores,
            params,
        })
    }

    // ========================================================================
    // 登録
    // ========================================================================

    pub fn get(&self, name: &str) -> Result<Workflow> {
        let key = normalize_name(name);
        self.workflows()
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))
    }

    /// カテゴリ名、またはそれを含むキーワードで絞り込む
    pub fn list(&self, category: Option<&str>) -> Vec<Workflow> {
        let category = category
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty());
        self.workflows()
            .values()
            .filter(|w| match &category {
                None => true,
                Some(c) => {
                    w.category.to_lowercase() == *c
                        || w.keywords.iter().any(|k| k.to_lowercase().contains(c.as_str()))
                }
            })
            .cloned()
            .collect()
    }

    /// ユーザー定義のワークフローを登録する（同名は上書き）
    pub fn create(&self, mut workflow: Workflow) -> Result<Workflow> {
        workflow.name = normalize_name(&workflow.name);
        if workflow.category.trim().is_empty() {
            workflow.category = "custom".to_string();
        }
        self.validate(&workflow)?;

        let replaced = self
            .workflows_mut()
            .insert(workflow.name.clone(), workflow.clone())
            .is_some();
        if replaced {
            tracing::info!("Replaced workflow {}", workflow.name);
        } else {
            tracing::info!("Created workflow {}", workflow.name);
        }
        Ok(workflow)
    }

    fn validate(&self, workflow: &Workflow) -> Result<()> {
        if workflow.name.is_empty() {
            return Err(EngineError::InvalidWorkflow("name is required".to_string()));
        }
        if workflow.steps.is_empty() {
            return Err(EngineError::InvalidWorkflow(format!(
                "workflow {} has no steps",
                workflow.name
            )));
        }
        if let Some(tool) = workflow.tools().into_iter().find(|t| !self.tools.contains(t)) {
            return Err(EngineError::InvalidWorkflow(format!(
                "workflow {} uses unknown tool '{}'",
                workflow.name, tool
            )));
        }
        for condition in &workflow.trigger_conditions {
            if !(0..=100).contains(&condition.confidence_weight) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "confidence weight {} is outside 0..=100",
                    condition.confidence_weight
                )));
            }
            if condition.kind == ConditionKind::Regex
                && let Err(e) = Regex::new(&condition.pattern)
            {
                return Err(EngineError::InvalidWorkflow(format!(
                    "invalid pattern '{}': {}",
                    condition.pattern, e
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // 実行
    // ========================================================================

    /// ステップを宣言順に実行する。最初に失敗したステップで全体を停止する
    pub async fn execute(&self, workflow: &Workflow, params: &Params) -> WorkflowResult {
        let started = Instant::now();
        tracing::info!("Executing workflow {}", workflow.name);

        let outcome = self
            .run_steps(&workflow.steps, params.clone(), Branch::Main)
            .await;
        let (success, error, failed_step) = match outcome.failure {
            None => (true, None, None),
            Some((tool, failure)) => {
                tracing::warn!("Workflow {} failed at {}: {}", workflow.name, tool, failure);
                (false, Some(failure), Some(tool))
            }
        };

        let recommendations = recommendations(&outcome.results, success);
        let duration = started.elapsed();
        WorkflowResult {
            workflow_name: workflow.name.clone(),
            step_results: outcome.results,
            success,
            error,
            failed_step,
            duration,
            duration_ms: millis(duration),
            recommendations,
        }
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [WorkflowStep],
        context: Params,
        branch: Branch,
    ) -> StepsFuture<'a> {
        Box::pin(async move {
            let mut results = Vec::new();
            for step in steps {
                let mut params = Params::from(step.default_params.clone());
                params.merge(&context);

                let started = Instant::now();
                let output = self.tools.call(&step.tool, &params).await;
                let duration = started.elapsed();
                results.push(StepResult {
                    tool: step.tool.clone(),
                    branch,
                    params: redact(params.as_map()),
                    success: output.success,
                    data: output.data.clone(),
                    error: output.error.clone(),
                    duration,
                    duration_ms: millis(duration),
                });

                if output.success {
                    if step.on_success.is_empty() {
                        continue;
                    }
                    let mut child = context.clone();
                    child.merge(&forwarded(&output.data));
                    let nested = self
                        .run_steps(&step.on_success, child, Branch::OnSuccess)
                        .await;
                    results.extend(nested.results);
                    if nested.failure.is_some() {
                        return StepsOutcome {
                            results,
                            failure: nested.failure,
                        };
                    }
                    continue;
                }

                let failure = output.error.unwrap_or_else(|| {
                    Failure::new(ErrorKind::Engine, format!("step {} failed", step.tool))
                });
                if !step.on_failure.is_empty() {
                    // 診断用。成否には影響しない
                    let diagnostics = self
                        .run_steps(&step.on_failure, context.clone(), Branch::OnFailure)
                        .await;
                    results.extend(diagnostics.results);
                }
                return StepsOutcome {
                    results,
                    failure: Some((step.tool.clone(), failure)),
                };
            }
            StepsOutcome {
                results,
                failure: None,
            }
        })
    }
}

/// `Ship It!` -> `ship_it`
fn normalize_name(name: &str) -> String {
    let mut normalized = String::new();
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c.to_ascii_lowercase());
        } else if !normalized.ends_with('_') {
            normalized.push('_');
        }
    }
    normalized.trim_matches('_').to_string()
}

/// 成功したステップの出力から後続ステップへ渡す値
fn forwarded(data: &Value) -> Params {
    let mut params = Params::new();
    if let Some(image) = data.get("full_image_name").and_then(Value::as_str) {
        params.insert("source_image", image);
        params.insert("image", image);
    }
    if let Some(image) = data
        .get("pushed_references")
        .and_then(|refs| refs.get(0))
        .and_then(Value::as_str)
    {
        params.insert("image", image);
    }
    params
}

pub(crate) fn redact(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| {
            let secret = ["password", "token", "secret"]
                .iter()
                .any(|s| k.to_lowercase().contains(s));
            let value = if secret {
                Value::String("***".to_string())
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}

fn recommendations(results: &[StepResult], success: bool) -> Vec<String> {
    if !success {
        return vec![
            "Workflow failed; check the error details of the failed step".to_string(),
            "Try running individual tools to debug the issue".to_string(),
        ];
    }

    let mut recommendations = vec!["Workflow completed successfully".to_string()];
    for result in results.iter().filter(|r| r.success) {
        match result.tool.as_str() {
            "image_build" => {
                recommendations.push("Container image built successfully".to_string());
                recommendations.push(
                    "Consider setting up an automated pipeline with pipeline_create".to_string(),
                );
            }
            "image_push" => {
                recommendations.push("Image pushed to registry".to_string());
                recommendations
                    .push("Set up image scanning for security compliance".to_string());
            }
            "app_deploy" => {
                match result.data.get("external_url").and_then(Value::as_str) {
                    Some(url) => recommendations.push(format!("Application available at {}", url)),
                    None => recommendations
                        .push("Application deployed; check its status with app_list".to_string()),
                }
            }
            _ => {}
        }
    }
    recommendations.dedup();
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolHandler, ToolOutput, ToolSpec};
    use crate::workflow::model::TriggerCondition;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const TOOLS: &[&str] = &[
        "image_build",
        "image_push",
        "image_inspect",
        "image_list",
        "registry_list",
        "app_deploy",
        "app_list",
    ];

    /// 呼び出しを記録し、指定されたツールだけ失敗させる
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Params)>>,
        failing: Mutex<HashSet<String>>,
    }

    impl Recorder {
        fn fail(&self, tool: &str) {
            self.failing.lock().unwrap().insert(tool.to_string());
        }

        fn tools_called(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }

        fn params_of(&self, tool: &str) -> Params {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(t, _)| t == tool)
                .map(|(_, p)| p.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl ToolHandler for Recorder {
        fn specs(&self) -> Vec<ToolSpec> {
            TOOLS.iter().map(|&t| ToolSpec::new(t, "test", vec![])).collect()
        }

        async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), params.clone()));
            if self.failing.lock().unwrap().contains(tool) {
                return Err(EngineError::Failed(Failure::new(
                    ErrorKind::Build,
                    format!("{} failed", tool),
                )));
            }
            let data = match tool {
                "image_build" => json!({
                    "full_image_name": params.str("image_name").unwrap_or_default()
                }),
                "image_push" => json!({
                    "pushed_references": [
                        format!("quay.io/{}", params.str("source_image").unwrap_or_default())
                    ]
                }),
                "app_deploy" => json!({ "external_url": "http://widget.apps.example.com" }),
                _ => json!({}),
            };
            Ok(ToolOutput::ok(data))
        }
    }

    fn setup() -> (Arc<Recorder>, WorkflowOrchestrator) {
        let recorder = Arc::new(Recorder::default());
        let mut registry = ToolRegistry::new();
        registry.register(recorder.clone());
        let orchestrator = WorkflowOrchestrator::new(Arc::new(registry)).unwrap();
        (recorder, orchestrator)
    }

    fn params(pairs: &[&str]) -> Params {
        Params::from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_analyze_selects_build_and_push() {
        let (_recorder, orchestrator) = setup();
        let analysis = orchestrator
            .analyze(
                "Build and push my app from https://github.com/acme/widget.git to quay.io/acme/widget:latest",
            )
            .unwrap();
        assert_eq!(analysis.workflow.name, "build_and_push");
        assert_eq!(analysis.score, 120);
        assert_eq!(analysis.scores.len(), 5);
        assert_eq!(
            analysis.params.str("source").as_deref(),
            Some("https://github.com/acme/widget.git")
        );
        assert!(
            analysis
                .params
                .str("image_name")
                .unwrap()
                .contains("quay.io/acme/widget")
        );
    }

    #[test]
    fn test_analyze_no_match_is_deterministic() {
        let (_recorder, orchestrator) = setup();
        for _ in 0..3 {
            let err = orchestrator.analyze("hello world").unwrap_err();
            assert!(matches!(err, EngineError::NoMatch { best_score: -30 }));
        }
    }

    #[test]
    fn test_tie_goes_to_first_name() {
        let (_recorder, orchestrator) = setup();
        for name in ["zz_tie", "aa_tie"] {
            let workflow = Workflow::new(name, "", "custom")
                .condition(TriggerCondition::keyword("zebra", 60))
                .step(WorkflowStep::new("image_list", ""));
            orchestrator.create(workflow).unwrap();
        }
        let analysis = orchestrator.analyze("zebra crossing").unwrap();
        assert_eq!(analysis.workflow.name, "aa_tie");
        assert_eq!(analysis.scores["zz_tie"], 60);
    }

    #[test]
    fn test_forced_selection() {
        let (_recorder, orchestrator) = setup();
        let analysis = orchestrator
            .select("hello world", Some("security_scan"))
            .unwrap();
        assert_eq!(analysis.workflow.name, "security_scan");
        assert_eq!(analysis.score, -30);

        let err = orchestrator.select("hello", Some("nope")).unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_forwards_built_image() {
        let (recorder, orchestrator) = setup();
        let workflow = orchestrator.get("complete_cicd").unwrap();
        let result = orchestrator
            .execute(&workflow, &params(&["source=.", "image_name=widget:v1"]))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            recorder.tools_called(),
            vec!["image_build", "image_push", "app_deploy"]
        );
        assert_eq!(
            recorder.params_of("image_push").str("source_image").as_deref(),
            Some("widget:v1")
        );
        assert_eq!(
            recorder.params_of("app_deploy").str("image").as_deref(),
            Some("quay.io/widget:v1")
        );
        assert!(
            result
                .recommendations
                .contains(&"Application available at http://widget.apps.example.com".to_string())
        );
        assert_eq!(result.step_results[1].branch, Branch::OnSuccess);
    }

    #[tokio::test]
    async fn test_first_failure_skips_children_and_siblings() {
        let (recorder, orchestrator) = setup();
        recorder.fail("image_build");
        let workflow = orchestrator.get("complete_cicd").unwrap();
        let result = orchestrator.execute(&workflow, &Params::new()).await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("image_build"));
        assert_eq!(result.error.unwrap().kind, ErrorKind::Build);
        assert_eq!(recorder.tools_called(), vec!["image_build"]);
        assert_eq!(result.recommendations.len(), 2);

        let (recorder, orchestrator) = setup();
        recorder.fail("registry_list");
        let workflow = orchestrator.get("registry_management").unwrap();
        let result = orchestrator.execute(&workflow, &Params::new()).await;
        assert!(!result.success);
        assert_eq!(recorder.tools_called(), vec!["registry_list"]);
    }

    #[tokio::test]
    async fn test_on_failure_runs_diagnostics_without_changing_outcome() {
        let (recorder, orchestrator) = setup();
        recorder.fail("app_deploy");
        let workflow = orchestrator.get("deploy_application").unwrap();
        let result = orchestrator
            .execute(&workflow, &params(&["image=widget:v1"]))
            .await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("app_deploy"));
        assert_eq!(recorder.tools_called(), vec!["app_deploy", "app_list"]);
        let diagnostic = result.step_results.last().unwrap();
        assert_eq!(diagnostic.branch, Branch::OnFailure);
        assert!(diagnostic.success);
    }

    #[tokio::test]
    async fn test_supplied_params_override_step_defaults() {
        let (recorder, orchestrator) = setup();
        let workflow = orchestrator
            .create(
                Workflow::new("Fresh Build!", "", "")
                    .step(WorkflowStep::new("image_build", "").param("no_cache", false)),
            )
            .unwrap();
        assert_eq!(workflow.name, "fresh_build");
        assert_eq!(workflow.category, "custom");

        let result = orchestrator
            .execute(
                &workflow,
                &params(&["no_cache=true", "image_name=w:1", "git_password=hunter2"]),
            )
            .await;
        assert!(result.success);
        assert_eq!(
            recorder.params_of("image_build").str("no_cache").as_deref(),
            Some("true")
        );
        assert_eq!(result.step_results[0].params["git_password"], "***");
    }

    #[test]
    fn test_create_validation() {
        let (_recorder, orchestrator) = setup();
        let unknown = Workflow::new("x", "", "custom").step(WorkflowStep::new("rm_rf", ""));
        assert!(matches!(
            orchestrator.create(unknown),
            Err(EngineError::InvalidWorkflow(_))
        ));

        let nested_unknown = Workflow::new("x", "", "custom").step(
            WorkflowStep::new("image_list", "").on_success(WorkflowStep::new("nope", "")),
        );
        assert!(orchestrator.create(nested_unknown).is_err());

        let empty = Workflow::new("x", "", "custom");
        assert!(orchestrator.create(empty).is_err());

        let bad_regex = Workflow::new("x", "", "custom")
            .condition(TriggerCondition::regex("(open", true, 50))
            .step(WorkflowStep::new("image_list", ""));
        assert!(orchestrator.create(bad_regex).is_err());

        let bad_weight = Workflow::new("x", "", "custom")
            .condition(TriggerCondition::regex("x", true, 150))
            .step(WorkflowStep::new("image_list", ""));
        assert!(orchestrator.create(bad_weight).is_err());
        assert!(orchestrator.get("x").is_err());
    }

    #[test]
    fn test_create_replaces_and_list_filters() {
        let (_recorder, orchestrator) = setup();
        let first = Workflow::new("nightly", "first", "maintenance")
            .step(WorkflowStep::new("image_list", ""));
        let second = Workflow::new("Nightly", "second", "maintenance")
            .step(WorkflowStep::new("image_list", ""));
        orchestrator.create(first).unwrap();
        orchestrator.create(second).unwrap();

        assert_eq!(orchestrator.get("nightly").unwrap().description, "second");
        assert_eq!(orchestrator.list(None).len(), 6);
        let maintenance = orchestrator.list(Some("maintenance"));
        assert_eq!(maintenance.len(), 1);
        // キーワード "registry" を持つ build_and_push も含まれる
        let registry: Vec<String> = orchestrator
            .list(Some("registry"))
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(registry, vec!["build_and_push", "registry_management"]);
    }

    #[test]
    fn test_builtins_require_their_tools() {
        let Err(err) = WorkflowOrchestrator::new(Arc::new(ToolRegistry::new())) else {
            panic!("builtin workflows must be rejected without their tools");
        };
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Ship It! "), "ship_it");
        assert_eq!(normalize_name("deploy--to__prod"), "deploy_to_prod");
    }
}
