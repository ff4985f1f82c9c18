use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// エラー分類
///
/// 各クレートのエラー型はこの分類にマップされ、ツール境界では
/// `Failure` としてシリアライズされる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Clone,
    Fetch,
    Build,
    Timeout,
    Auth,
    NotFound,
    Validation,
    PartialFailure,
    Engine,
    Cluster,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Clone => "clone",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Build => "build",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::Engine => "engine",
            ErrorKind::Cluster => "cluster",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 結果値に添付される構造化エラー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn partial(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PartialFailure, message)
    }
}

/// エラー型を分類にマップする
pub trait Classify: fmt::Display {
    fn kind(&self) -> ErrorKind;

    fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}

impl Classify for Failure {
    fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn to_failure(&self) -> Failure {
        self.clone()
    }
}
