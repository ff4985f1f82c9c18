//! ツール境界
//!
//! エンジンの各操作を「名前 + フラットなパラメータマップ → 構造化された結果」の
//! ツールとして公開する。シリアライズ形式には依存しない。

pub mod app;
pub mod git;
pub mod image;
pub mod pipeline;
pub mod registry;

pub use app::AppTools;
pub use git::GitTools;
pub use image::ImageTools;
pub use pipeline::PipelineTools;
pub use registry::RegistryTools;

use crate::error::{EngineError, Result};
use crate::params::Params;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use shipflow_core::{Classify, Failure};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// 結果とツール定義
// ============================================================================

/// ツール呼び出しの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl ToolOutput {
    pub fn ok(data: impl Serialize) -> Self {
        Self::from_data(data, true, None)
    }

    /// 結果自体が成否とエラーを持つ場合（ビルド・プッシュ・デプロイ）
    pub fn outcome(data: impl Serialize, success: bool, error: Option<Failure>) -> Self {
        Self::from_data(data, success, error)
    }

    pub fn failed(error: Failure) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error),
        }
    }

    fn from_data(data: impl Serialize, success: bool, error: Option<Failure>) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success,
                data,
                error,
            },
            Err(e) => Self::failed(Failure::new(
                shipflow_core::ErrorKind::Io,
                format!("failed to serialize tool result: {}", e),
            )),
        }
    }
}

/// パラメータの型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    /// 配列またはカンマ区切りの文字列
    List,
    /// オブジェクトまたは `k=v,k2=v2`
    Map,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub fn optional(name: &'static str, kind: ParamType, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }

    fn schema(&self) -> Value {
        // 文字列での指定も受け付けるため、型は複数許可する
        let types = match self.kind {
            ParamType::String => json!("string"),
            ParamType::Integer => json!(["integer", "string"]),
            ParamType::Boolean => json!(["boolean", "string"]),
            ParamType::List => json!(["array", "string"]),
            ParamType::Map => json!(["object", "string"]),
        };
        let mut schema = json!({
            "type": types,
            "description": self.description,
        });
        if self.kind == ParamType::List {
            schema["items"] = json!({ "type": "string" });
        }
        schema
    }
}

/// ツールの宣言
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn new(name: &'static str, description: &'static str, params: Vec<ParamSpec>) -> Self {
        Self {
            name,
            description,
            params,
        }
    }

    /// JSON Schema（object）としての入力定義
    pub fn input_schema(&self) -> Map<String, Value> {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();

        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert("properties".to_string(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".to_string(), json!(required));
        }
        schema
    }
}

// ============================================================================
// ハンドラとレジストリ
// ============================================================================

/// 関連するツールをまとめて処理するハンドラ
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;

    async fn call(&self, tool: &str, params: &Params) -> Result<ToolOutput>;
}

/// ツール名からハンドラへのディスパッチ表
#[derive(Clone, Default)]
pub struct ToolRegistry {
    specs: BTreeMap<&'static str, ToolSpec>,
    handlers: BTreeMap<&'static str, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// ハンドラが宣言する全ツールを登録（同名は後勝ち）
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        for spec in handler.specs() {
            self.handlers.insert(spec.name, handler.clone());
            self.specs.insert(spec.name, spec);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.get(name)
    }

    /// 名前順のツール定義
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.specs.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }

    /// ツールを呼び出す。失敗も `ToolOutput` として返す
    pub async fn call(&self, name: &str, params: &Params) -> ToolOutput {
        match self.dispatch(name, params).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Tool {} failed: {}", name, e);
                ToolOutput::failed(e.to_failure())
            }
        }
    }

    async fn dispatch(&self, name: &str, params: &Params) -> Result<ToolOutput> {
        let (Some(handler), Some(spec)) = (self.handlers.get(name), self.specs.get(name)) else {
            return Err(EngineError::UnknownTool(name.to_string()));
        };
        if let Some(missing) = spec.params.iter().find(|p| p.required && !params.has(p.name)) {
            return Err(EngineError::MissingParam(missing.name.to_string()));
        }
        tracing::debug!("Calling tool {}", name);
        handler.call(name, params).await
    }
}
