//! Shipflow Core
//!
//! 各コンポーネントで共有するエラー分類とイメージ参照ユーティリティ。

pub mod error;
pub mod image;

pub use error::{Classify, ErrorKind, Failure};
pub use image::{
    extract_registry, has_registry_host, image_reference, qualify_image, short_hash,
    split_image_tag,
};

/// 管理ラベルのキー
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// 結果に載せる所要時間（ミリ秒）
pub fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
