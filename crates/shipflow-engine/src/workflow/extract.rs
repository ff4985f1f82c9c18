//! プロンプトからのパラメータ抽出

use crate::params::Params;
use regex::Regex;
use shipflow_core::{extract_registry, has_registry_host};
use std::sync::LazyLock;

/// (パラメータ名, 最初のキャプチャが値となるパターン)
static PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("source", r"(?i)(https?://[^\s]+\.git|git@[^\s]+\.git)"),
        (
            "image_name",
            r"(?i)(?:image[:\s]+|docker[:\s]+|container[:\s]+)([a-z0-9._/-]+:[a-z0-9._-]+)",
        ),
        (
            "registry",
            r"(?i)(?:registry[:\s]+|push to[:\s]+)([a-z0-9.-]+\.[a-z]{2,})",
        ),
        ("namespace", r"(?i)(?:namespace[:\s]+|deploy to[:\s]+)([a-z0-9-]+)"),
        ("dockerfile", r"(?i)(?:dockerfile[:\s]+|docker file[:\s]+)([a-z0-9./]+)"),
    ]
    .into_iter()
    .filter_map(|(key, pattern)| Regex::new(pattern).ok().map(|re| (key, re)))
    .collect()
});

/// 自然言語のプロンプトから既知のパラメータを取り出す
///
/// 値が取れなかったキーは含まれない。呼び出し側の指定で上書きされる前提。
pub fn extract_params(prompt: &str) -> Params {
    let mut params = Params::new();
    for (key, re) in PATTERNS.iter() {
        if let Some(value) = re.captures(prompt).and_then(|c| c.get(1)) {
            params.insert(key, value.as_str());
        }
    }
    if params.has("source") {
        params.insert("source_type", "git");
    }

    // レジストリ付きのイメージ参照らしきトークン
    for token in prompt.split_whitespace() {
        if token.contains("://") || token.starts_with("git@") {
            continue;
        }
        let token = token
            .trim_matches(|c: char| matches!(c, ',' | ';' | '"' | '\'' | '`' | '(' | ')' | '!' | '?'))
            .trim_end_matches('.');
        if token.contains('/') && has_registry_host(token) {
            params.insert_default("image_name", token);
            params.insert_default("registry", extract_registry(token));
            break;
        }
    }

    if !params.has("registry")
        && let Some(image) = params.str("image_name")
        && has_registry_host(&image)
    {
        params.insert("registry", extract_registry(&image));
    }
    params
}
