//! ワークフローオーケストレーター
//!
//! 自然言語のプロンプトから適切なワークフローを選び、抽出したパラメータで
//! ツールを順に呼び出す。

pub mod builtin;
pub mod classifier;
pub mod extract;
pub mod model;
pub mod orchestrator;
pub mod tools;

pub use classifier::{IntentClassifier, KeywordClassifier};
pub use extract::extract_params;
pub use model::{
    Branch, ConditionKind, StepResult, TriggerCondition, Workflow, WorkflowResult, WorkflowStep,
};
pub use orchestrator::{Analysis, MIN_SCORE, WorkflowOrchestrator};
pub use tools::WorkflowTools;
