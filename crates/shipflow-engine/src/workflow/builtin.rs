//! 組み込みワークフロー

use super::model::{TriggerCondition, Workflow, WorkflowStep};

pub fn builtin_workflows() -> Vec<Workflow> {
    vec![
        build_and_push(),
        complete_cicd(),
        deploy_application(),
        security_scan(),
        registry_management(),
    ]
}

fn build_and_push() -> Workflow {
    Workflow::new(
        "build_and_push",
        "Build a container image from source and push it to a registry",
        "build",
    )
    .keywords(&["build", "push", "deploy", "container", "image", "registry"])
    .condition(TriggerCondition::regex(
        "build.*push|deploy.*container|containerize.*deploy",
        true,
        90,
    ))
    .condition(TriggerCondition::regex(
        "source.*registry|git.*registry|dockerfile.*registry",
        false,
        80,
    ))
    .step(
        WorkflowStep::new("image_build", "Build the container image from source")
            .on_success(WorkflowStep::new("image_push", "Push the built image to the registry")),
    )
}

fn complete_cicd() -> Workflow {
    let deploy = WorkflowStep::new("app_deploy", "Deploy the pushed image")
        .on_failure(WorkflowStep::new("app_list", "Show applications for diagnosis"));
    Workflow::new(
        "complete_cicd",
        "Build, push and deploy an application end to end",
        "cicd",
    )
    .keywords(&["cicd", "pipeline", "full", "complete", "end-to-end"])
    .condition(TriggerCondition::regex(
        "full.*pipeline|complete.*cicd|end.*end",
        true,
        95,
    ))
    .step(
        WorkflowStep::new("image_build", "Build the container image from source").on_success(
            WorkflowStep::new("image_push", "Push the built image to the registry")
                .on_success(deploy),
        ),
    )
}

fn deploy_application() -> Workflow {
    Workflow::new(
        "deploy_application",
        "Deploy an existing image to Kubernetes or OpenShift",
        "deployment",
    )
    .keywords(&[
        "deploy",
        "application",
        "app",
        "kubernetes",
        "openshift",
        "namespace",
        "rollout",
    ])
    .condition(TriggerCondition::regex(
        "deploy.*(app|application|service)|roll.*out",
        true,
        85,
    ))
    .step(
        WorkflowStep::new("app_deploy", "Deploy the application")
            .on_failure(WorkflowStep::new("app_list", "Show applications for diagnosis")),
    )
}

fn security_scan() -> Workflow {
    Workflow::new(
        "security_scan",
        "Inspect a container image for security review",
        "security",
    )
    .keywords(&["security", "scan", "vulnerability", "audit", "compliance"])
    .condition(TriggerCondition::regex(
        "security.*scan|vulnerability.*check|audit.*container",
        true,
        90,
    ))
    .step(WorkflowStep::new("image_inspect", "Inspect image metadata"))
}

fn registry_management() -> Workflow {
    Workflow::new(
        "registry_management",
        "List registry profiles and local images",
        "registry",
    )
    .keywords(&["registry", "manage", "list", "clean", "prune"])
    .condition(TriggerCondition::regex(
        "manage.*registry|list.*images|clean.*registry",
        true,
        85,
    ))
    .step(WorkflowStep::new("registry_list", "List registry profiles"))
    .step(WorkflowStep::new("image_list", "List local images"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_builtin_names_are_unique() {
        let mut names: Vec<String> = builtin_workflows().into_iter().map(|w| w.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_builtin_patterns_compile() {
        for workflow in builtin_workflows() {
            assert!(!workflow.steps.is_empty(), "{}", workflow.name);
            for condition in &workflow.trigger_conditions {
                assert!(Regex::new(&condition.pattern).is_ok(), "{}", condition.pattern);
            }
        }
    }

    #[test]
    fn test_complete_cicd_nesting() {
        let workflow = complete_cicd();
        assert_eq!(
            workflow.tools(),
            vec!["image_build", "image_push", "app_deploy", "app_list"]
        );
    }
}
