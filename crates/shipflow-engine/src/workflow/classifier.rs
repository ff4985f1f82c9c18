//! プロンプトとワークフローの適合度の採点

use super::model::{ConditionKind, TriggerCondition, Workflow};
use regex::Regex;

/// キーワード1件あたりの加点
pub const KEYWORD_SCORE: i32 = 15;
/// 必須条件が満たされない場合の減点
pub const MISSING_REQUIRED_PENALTY: i32 = 30;

/// 意図分類器
pub trait IntentClassifier: Send + Sync {
    /// `prompt` は小文字化済み
    fn score(&self, prompt: &str, workflow: &Workflow) -> i32;
}

/// キーワードと条件による既定の分類器
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl IntentClassifier for KeywordClassifier {
    fn score(&self, prompt: &str, workflow: &Workflow) -> i32 {
        let mut score = 0;
        for keyword in &workflow.keywords {
            if prompt.contains(&keyword.to_lowercase()) {
                score += KEYWORD_SCORE;
            }
        }

        for condition in &workflow.trigger_conditions {
            if matches(prompt, condition) {
                score += if condition.required {
                    condition.confidence_weight
                } else {
                    condition.confidence_weight / 2
                };
            } else if condition.required {
                score -= MISSING_REQUIRED_PENALTY;
            }
        }
        score
    }
}

fn matches(prompt: &str, condition: &TriggerCondition) -> bool {
    let pattern = condition.pattern.to_lowercase();
    match condition.kind {
        ConditionKind::Keyword => prompt.contains(&pattern),
        // 不正なパターンは一致しない扱い（登録時に検証済み）
        ConditionKind::Regex => Regex::new(&pattern)
            .map(|re| re.is_match(prompt))
            .unwrap_or(false),
        ConditionKind::Context => pattern
            .split(".*")
            .filter(|fragment| !fragment.is_empty())
            .all(|fragment| prompt.contains(fragment)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::builtin::builtin_workflows;

    fn score(prompt: &str, name: &str) -> i32 {
        let workflow = builtin_workflows()
            .into_iter()
            .find(|w| w.name == name)
            .unwrap();
        KeywordClassifier.score(&prompt.to_lowercase(), &workflow)
    }

    const PROMPT: &str =
        "Build and push my app from https://github.com/acme/widget.git to quay.io/acme/widget:latest";

    #[test]
    fn test_scores_for_build_and_push_prompt() {
        // build, push: 30 + 必須条件 90
        assert_eq!(score(PROMPT, "build_and_push"), 120);
        assert_eq!(score(PROMPT, "complete_cicd"), -30);
        // app: 15 - 30
        assert_eq!(score(PROMPT, "deploy_application"), -15);
        assert_eq!(score(PROMPT, "security_scan"), -30);
        assert_eq!(score(PROMPT, "registry_management"), -30);
    }

    #[test]
    fn test_optional_condition_adds_half_weight() {
        let workflow = Workflow::new("w", "", "custom")
            .condition(TriggerCondition::regex("git.*registry", false, 81));
        assert_eq!(KeywordClassifier.score("git to registry", &workflow), 40);
        assert_eq!(KeywordClassifier.score("nothing", &workflow), 0);
    }

    #[test]
    fn test_condition_kinds() {
        let keyword = TriggerCondition {
            kind: ConditionKind::Keyword,
            pattern: "Ship".to_string(),
            required: true,
            confidence_weight: 50,
        };
        assert!(matches("ship it", &keyword));

        let context = TriggerCondition {
            kind: ConditionKind::Context,
            pattern: "deploy.*staging".to_string(),
            ..keyword.clone()
        };
        assert!(matches("deploy widget to staging", &context));
        assert!(!matches("deploy widget", &context));

        let invalid = TriggerCondition {
            kind: ConditionKind::Regex,
            pattern: "(unclosed".to_string(),
            ..keyword
        };
        assert!(!matches("(unclosed", &invalid));
    }
}
