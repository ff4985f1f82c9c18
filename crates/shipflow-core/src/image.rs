//! イメージ参照ユーティリティ

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // ポート番号は / を含まない純粋な数字
        if !potential_tag.contains('/') && !potential_tag.chars().all(|c| c.is_ascii_digit()) {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `quay.io/acme/widget:latest` -> `quay.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> String {
    match registry_segment(image) {
        Some(host) => host.to_string(),
        None => "docker.io".to_string(),
    }
}

/// 先頭セグメントがレジストリホストかどうか
pub fn has_registry_host(image: &str) -> bool {
    registry_segment(image).is_some()
}

fn registry_segment(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// `name:tag` 形式の参照を組み立てる
pub fn image_reference(name: &str, tag: &str) -> String {
    format!("{}:{}", name, tag)
}

/// レジストリホストを持たないイメージ名にホストを付与
///
/// スキーム付きのレジストリ URL (`https://quay.io/`) も受け付ける。
pub fn qualify_image(image: &str, registry: &str) -> String {
    let host = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');

    if host.is_empty() || has_registry_host(image) {
        return image.to_string();
    }
    format!("{}/{}", host, image)
}

/// コミットハッシュの先頭 8 文字
pub fn short_hash(commit: &str) -> String {
    commit.chars().take(8).collect()
}
