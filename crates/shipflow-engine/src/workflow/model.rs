//! ワークフローのデータモデル

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shipflow_core::Failure;
use std::time::Duration;

/// 名前付きの手順の集まり
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, alias = "conditions")]
    pub trigger_conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

fn default_category() -> String {
    "custom".to_string()
}

impl Workflow {
    pub fn new(name: &str, description: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            keywords: Vec::new(),
            trigger_conditions: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn condition(mut self, condition: TriggerCondition) -> Self {
        self.trigger_conditions.push(condition);
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 入れ子のステップも含めた全ツール名
    pub fn tools(&self) -> Vec<&str> {
        fn collect<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a str>) {
            for step in steps {
                out.push(&step.tool);
                collect(&step.on_success, out);
                collect(&step.on_failure, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }
}

/// ツール呼び出し1回分
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowStep {
    pub tool: String,
    pub description: String,
    #[serde(alias = "parameters")]
    pub default_params: Map<String, Value>,
    /// 親が成功した場合のみ実行
    pub on_success: Vec<WorkflowStep>,
    /// 親が失敗した場合に診断用として実行（結果は成否に影響しない）
    pub on_failure: Vec<WorkflowStep>,
}

impl WorkflowStep {
    pub fn new(tool: &str, description: &str) -> Self {
        Self {
            tool: tool.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.default_params.insert(key.to_string(), value.into());
        self
    }

    pub fn on_success(mut self, step: WorkflowStep) -> Self {
        self.on_success.push(step);
        self
    }

    pub fn on_failure(mut self, step: WorkflowStep) -> Self {
        self.on_failure.push(step);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    /// 部分文字列
    Keyword,
    /// 正規表現
    Regex,
    /// `.*` で区切られた断片がすべて含まれる
    Context,
}

/// プロンプトに対する選択条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    #[serde(rename = "type", alias = "kind")]
    pub kind: ConditionKind,
    pub pattern: String,
    #[serde(default)]
    pub required: bool,
    #[serde(alias = "confidence")]
    pub confidence_weight: i32,
}

impl TriggerCondition {
    pub fn keyword(pattern: &str, confidence_weight: i32) -> Self {
        Self {
            kind: ConditionKind::Keyword,
            pattern: pattern.to_string(),
            required: true,
            confidence_weight,
        }
    }

    pub fn regex(pattern: &str, required: bool, confidence_weight: i32) -> Self {
        Self {
            kind: ConditionKind::Regex,
            pattern: pattern.to_string(),
            required,
            confidence_weight,
        }
    }
}

/// ステップがどの分岐で実行されたか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Main,
    OnSuccess,
    OnFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub tool: String,
    pub branch: Branch,
    /// 実際に渡したパラメータ（秘密情報は伏せる）
    pub params: Map<String, Value>,
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    pub duration: Duration,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_name: String,
    pub step_results: Vec<StepResult>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub duration: Duration,
    pub duration_ms: u64,
    pub recommendations: Vec<String>,
}
