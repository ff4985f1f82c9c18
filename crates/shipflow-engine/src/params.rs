//! フラットなツールパラメータの寛容な解釈
//!
//! 文字列で渡された値も整数・真偽値・カンマ区切りリスト・`k=v` マップとして読む。

use crate::error::{EngineError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// `k=v` 形式の引数列から組み立てる
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = Map::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| EngineError::invalid(pair, "expected key=value"))?;
            map.insert(key.trim().to_string(), Value::String(value.to_string()));
        }
        Ok(Self(map))
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// 既存の値を上書きしない
    pub fn insert_default(&mut self, key: &str, value: impl Into<Value>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    /// `other` の値で上書きする
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// 値があり、空文字列でも null でもない
    pub fn has(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    pub fn str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn required_str(&self, key: &str) -> Result<String> {
        self.str(key)
            .ok_or_else(|| EngineError::MissingParam(key.to_string()))
    }

    pub fn int(&self, key: &str) -> Result<Option<i64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| EngineError::invalid(key, format!("not an integer: {}", n))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| EngineError::invalid(key, format!("not an integer: {}", s))),
            Some(other) => Err(EngineError::invalid(key, format!("not an integer: {}", other))),
        }
    }

    pub fn i32(&self, key: &str) -> Result<Option<i32>> {
        self.int(key)?
            .map(|v| {
                i32::try_from(v).map_err(|_| EngineError::invalid(key, "value out of range"))
            })
            .transpose()
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        self.int(key)?
            .map(|v| u64::try_from(v).map_err(|_| EngineError::invalid(key, "must not be negative")))
            .transpose()
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::Number(n)) => Ok(Some(n.as_i64() != Some(0))),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" | "yes" | "y" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "n" | "0" | "off" => Ok(Some(false)),
                other => Err(EngineError::invalid(key, format!("not a boolean: {}", other))),
            },
            Some(other) => Err(EngineError::invalid(key, format!("not a boolean: {}", other))),
        }
    }

    pub fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.bool(key)?.unwrap_or(false))
    }

    /// 配列またはカンマ区切りの文字列
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// オブジェクトまたは `k=v,k2=v2` 形式の文字列
    pub fn map(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Object(object)) => Ok(object
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()),
            Some(Value::String(s)) => {
                let mut map = BTreeMap::new();
                for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    let (k, v) = entry.split_once('=').ok_or_else(|| {
                        EngineError::invalid(key, format!("expected k=v, got '{}'", entry))
                    })?;
                    map.insert(k.trim().to_string(), v.trim().to_string());
                }
                Ok(map)
            }
            Some(other) => Err(EngineError::invalid(key, format!("not a map: {}", other))),
        }
    }
}
