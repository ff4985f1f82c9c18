//! Shipflow エンジン
//!
//! パイプライン管理、ワークフローオーケストレーター、ツールレジストリを提供する。
//! MCP サーバーや CLI はこのクレートの [`Engine`] を通じて操作する。

pub mod engine;
pub mod error;
pub mod params;
pub mod pipeline;
pub mod tools;
pub mod workflow;

pub use engine::{Engine, EngineParts};
pub use error::{EngineError, Result};
pub use params::Params;
pub use pipeline::{Pipeline, PipelineManager, PipelineRun, RunHandle, Status, Trigger};
pub use tools::{ParamSpec, ParamType, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};
pub use workflow::{Analysis, Workflow, WorkflowOrchestrator, WorkflowResult, WorkflowStep};
