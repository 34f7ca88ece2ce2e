//! The Chimera workflow: autonomous test-driven feature delivery.
//!
//! generate E2E test -> implement -> guardian review -> deploy to staging ->
//! validate on staging. Review or validation failures loop back to
//! implementation (bounded by the workflow retry budget); generation and
//! deployment failures are fatal.

use std::time::Duration;

use serde_json::json;

use super::definition::{ParamSource, PhaseSpec, WorkflowDefinition, WorkflowState};
use crate::task::TaskSpec;

pub const WORKFLOW_TYPE: &str = "chimera_workflow";

pub const E2E_TEST_GENERATION: &str = "e2e_test_generation";
pub const CODE_IMPLEMENTATION: &str = "code_implementation";
pub const GUARDIAN_REVIEW: &str = "guardian_review";
pub const STAGING_DEPLOYMENT: &str = "staging_deployment";
pub const E2E_VALIDATION: &str = "e2e_validation";
pub const COMPLETE: &str = "complete";
pub const FAILED: &str = "failed";

/// The Chimera state machine definition.
pub fn definition() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_type: WORKFLOW_TYPE,
        phases: vec![
            PhaseSpec {
                name: E2E_TEST_GENERATION,
                agent_type: "e2e-tester-agent",
                action: "generate_test",
                on_success: CODE_IMPLEMENTATION,
                on_failure: FAILED,
                timeout: Duration::from_secs(300),
                params: vec![
                    ("feature", ParamSource::Payload("feature_description")),
                    ("url", ParamSource::Payload("target_url")),
                ],
                captures: vec![],
                terminal: false,
            },
            PhaseSpec {
                name: CODE_IMPLEMENTATION,
                agent_type: "coder-agent",
                action: "implement_feature",
                on_success: GUARDIAN_REVIEW,
                on_failure: FAILED,
                timeout: Duration::from_secs(1800),
                params: vec![
                    ("test_path", ParamSource::Artifact("test_path")),
                    ("feature", ParamSource::Payload("feature_description")),
                ],
                captures: vec![("test_path", "test_path")],
                terminal: false,
            },
            PhaseSpec {
                name: GUARDIAN_REVIEW,
                agent_type: "guardian-agent",
                action: "review_pr",
                on_success: STAGING_DEPLOYMENT,
                on_failure: CODE_IMPLEMENTATION,
                timeout: Duration::from_secs(600),
                params: vec![("pr_id", ParamSource::Artifact("code_pr_id"))],
                captures: vec![("code_pr_id", "pr_id"), ("commit_sha", "commit_sha")],
                terminal: false,
            },
            PhaseSpec {
                name: STAGING_DEPLOYMENT,
                agent_type: "deployment-agent",
                action: "deploy_to_staging",
                on_success: E2E_VALIDATION,
                on_failure: FAILED,
                timeout: Duration::from_secs(900),
                params: vec![("commit_sha", ParamSource::Artifact("commit_sha"))],
                captures: vec![("review_decision", "decision")],
                terminal: false,
            },
            PhaseSpec {
                name: E2E_VALIDATION,
                agent_type: "e2e-tester-agent",
                action: "execute_test",
                on_success: COMPLETE,
                on_failure: CODE_IMPLEMENTATION,
                timeout: Duration::from_secs(600),
                params: vec![
                    ("test_path", ParamSource::Artifact("test_path")),
                    (
                        "url",
                        ParamSource::ArtifactOrPayload("deployment_url", "staging_url"),
                    ),
                ],
                captures: vec![("deployment_url", "staging_url")],
                terminal: false,
            },
            PhaseSpec::terminal(COMPLETE, vec![("validation_status", "status")]),
            PhaseSpec::terminal(FAILED, vec![("error_message", "error")]),
        ],
        initial_phase: E2E_TEST_GENERATION,
        success_terminal: COMPLETE,
        failure_terminal: FAILED,
    }
}

/// Build the task spec for a new Chimera run.
pub fn task_spec(
    feature_description: &str,
    target_url: &str,
    staging_url: Option<&str>,
    priority: i64,
) -> TaskSpec {
    let short: String = feature_description.chars().take(50).collect();
    let mut spec = TaskSpec::new(format!("Chimera: {short}"), WORKFLOW_TYPE);
    spec.description = feature_description.to_string();
    spec.priority = priority;
    spec.payload = Some(json!({
        "feature_description": feature_description,
        "target_url": target_url,
        "staging_url": staging_url,
    }));
    spec.workflow = Some(WorkflowState::new(&definition()).to_value());
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_validates() {
        definition().validate().unwrap();
    }

    #[test]
    fn reference_transition_table() {
        let def = definition();

        let r#gen = def.phase(E2E_TEST_GENERATION).unwrap();
        assert_eq!(r#gen.agent_type, "e2e-tester-agent");
        assert_eq!(r#gen.action, "generate_test");
        assert_eq!(r#gen.on_success, CODE_IMPLEMENTATION);
        assert_eq!(r#gen.on_failure, FAILED);
        assert_eq!(r#gen.timeout, Duration::from_secs(300));

        let code = def.phase(CODE_IMPLEMENTATION).unwrap();
        assert_eq!(code.agent_type, "coder-agent");
        assert_eq!(code.action, "implement_feature");
        assert_eq!(code.on_success, GUARDIAN_REVIEW);
        assert_eq!(code.on_failure, FAILED);
        assert_eq!(code.timeout, Duration::from_secs(1800));

        let review = def.phase(GUARDIAN_REVIEW).unwrap();
        assert_eq!(review.agent_type, "guardian-agent");
        assert_eq!(review.action, "review_pr");
        assert_eq!(review.on_success, STAGING_DEPLOYMENT);
        assert_eq!(review.on_failure, CODE_IMPLEMENTATION);
        assert_eq!(review.timeout, Duration::from_secs(600));

        let deploy = def.phase(STAGING_DEPLOYMENT).unwrap();
        assert_eq!(deploy.agent_type, "deployment-agent");
        assert_eq!(deploy.action, "deploy_to_staging");
        assert_eq!(deploy.on_success, E2E_VALIDATION);
        assert_eq!(deploy.on_failure, FAILED);
        assert_eq!(deploy.timeout, Duration::from_secs(900));

        let validate = def.phase(E2E_VALIDATION).unwrap();
        assert_eq!(validate.agent_type, "e2e-tester-agent");
        assert_eq!(validate.action, "execute_test");
        assert_eq!(validate.on_success, COMPLETE);
        assert_eq!(validate.on_failure, CODE_IMPLEMENTATION);
        assert_eq!(validate.timeout, Duration::from_secs(600));

        assert!(def.is_terminal(COMPLETE));
        assert!(def.is_terminal(FAILED));
    }

    #[test]
    fn review_loops_back_to_an_earlier_phase() {
        let def = definition();
        let review_idx = def.phase_index(GUARDIAN_REVIEW).unwrap();
        let code_idx = def.phase_index(CODE_IMPLEMENTATION).unwrap();
        assert!(code_idx < review_idx);
    }

    #[test]
    fn task_spec_shape() {
        let spec = task_spec("User can log in with SSO", "https://app/login", None, 3);
        assert_eq!(spec.task_type, WORKFLOW_TYPE);
        assert!(spec.title.starts_with("Chimera: "));
        let workflow = spec.workflow.unwrap();
        assert_eq!(workflow["current_phase"], E2E_TEST_GENERATION);
        assert_eq!(workflow["retry_count"], 0);
        assert_eq!(workflow["max_retries"], 3);
    }

    #[test]
    fn long_titles_truncate() {
        let long = "x".repeat(120);
        let spec = task_spec(&long, "https://app", None, 3);
        assert_eq!(spec.title.len(), "Chimera: ".len() + 50);
        assert_eq!(spec.description.len(), 120);
    }
}
