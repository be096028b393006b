use std::collections::BTreeMap;

use ferry_core::clock::{unix_millis, unix_millis_of};
use ferry_core::config::FerryConfig;
use ferry_core::error::FerryResult;
use ferry_core::ports::{SourceControl, Workflow};
use ferry_core::types::PromotionRequest;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    Dispatched { tag: String, workflow_id: u64 },
    /// The repository has no promotion workflow; nothing was changed.
    NoWorkflow,
}

/// Tags the approved sha and dispatches the deploy workflow for the next
/// environment, using that environment's credential.
pub struct PromotionTrigger<'a> {
    source: &'a dyn SourceControl,
    config: &'a FerryConfig,
}

impl<'a> PromotionTrigger<'a> {
    pub fn new(source: &'a dyn SourceControl, config: &'a FerryConfig) -> Self {
        Self { source, config }
    }

    pub fn promote(&self, req: &PromotionRequest) -> FerryResult<PromoteOutcome> {
        let credential = self.config.credential_for(&req.next_env)?;
        let workflows = self
            .source
            .list_workflows(&credential, &req.owner, &req.repo)?;
        let Some(workflow) = find_workflow(&workflows, &self.config.promotion_workflow) else {
            warn!(
                repo = %req.repo,
                next_env = %req.next_env,
                workflow = %self.config.promotion_workflow,
                "no promotion workflow; skipping"
            );
            return Ok(PromoteOutcome::NoWorkflow);
        };

        // Named after the approval so a retried delivery reuses its tag.
        let millis = unix_millis_of(&req.approved_at).unwrap_or_else(|_| unix_millis());
        let tag = format!("{}-{millis}", req.next_env);
        let created = self.source.create_ref(
            &credential,
            &req.owner,
            &req.repo,
            &format!("refs/tags/{tag}"),
            &req.sha,
        )?;
        if !created {
            info!(repo = %req.repo, tag = %tag, "reusing promotion tag from an earlier attempt");
        }

        let mut inputs = BTreeMap::new();
        inputs.insert("deploy_env".to_string(), req.next_env.clone());
        if let Some(role) = self
            .config
            .env(&req.next_env)
            .and_then(|e| e.deploy_role.clone())
        {
            inputs.insert("deploy_role".to_string(), role);
        }
        self.source
            .dispatch_workflow(&credential, &req.owner, &req.repo, workflow.id, &tag, &inputs)?;

        info!(
            repo = %req.repo,
            sha = %req.sha,
            from = %req.source_env,
            to = %req.next_env,
            approved_by = %req.approved_by,
            tag = %tag,
            "promotion dispatched"
        );
        Ok(PromoteOutcome::Dispatched {
            tag,
            workflow_id: workflow.id,
        })
    }
}

/// Match by display name, or by file name stem (`deploy-to-env.yml`).
fn find_workflow<'w>(workflows: &'w [Workflow], name: &str) -> Option<&'w Workflow> {
    workflows.iter().find(|w| w.name == name).or_else(|| {
        workflows.iter().find(|w| {
            let file = w.path.rsplit('/').next().unwrap_or(&w.path);
            file.strip_suffix(".yml")
                .or_else(|| file.strip_suffix(".yaml"))
                .is_some_and(|stem| stem == name)
        })
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ferry_core::config::Credential;
    use ferry_core::error::FerryError;
    use ferry_core::ports::CommitDetail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every call; optionally fails ref creation or the next dispatches.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub workflows: Vec<Workflow>,
        pub fail_refs: bool,
        pub fail_dispatches: AtomicUsize,
        pub calls: Mutex<Vec<String>>,
        pub refs: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_deploy_workflow() -> Self {
            Self {
                workflows: vec![
                    Workflow {
                        id: 1,
                        name: "CI".into(),
                        path: ".github/workflows/ci.yml".into(),
                        state: "active".into(),
                    },
                    Workflow {
                        id: 42,
                        name: "Deploy to environment".into(),
                        path: ".github/workflows/deploy-to-env.yml".into(),
                        state: "active".into(),
                    },
                ],
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SourceControl for FakeSource {
        fn create_ref(&self, cred: &Credential, _: &str, repo: &str, git_ref: &str, sha: &str) -> FerryResult<bool> {
            if self.fail_refs {
                return Err(FerryError::upstream("github", "502 bad gateway"));
            }
            let mut refs = self.refs.lock().unwrap();
            if refs.iter().any(|r| r == git_ref) {
                return Ok(false);
            }
            refs.push(git_ref.to_string());
            self.calls
                .lock()
                .unwrap()
                .push(format!("ref {repo} {git_ref} {sha} {}", cred.expose()));
            Ok(true)
        }

        fn list_workflows(&self, _: &Credential, _: &str, _: &str) -> FerryResult<Vec<Workflow>> {
            Ok(self.workflows.clone())
        }

        fn dispatch_workflow(
            &self,
            _: &Credential,
            _: &str,
            repo: &str,
            workflow_id: u64,
            git_ref: &str,
            inputs: &BTreeMap<String, String>,
        ) -> FerryResult<()> {
            let remaining = self.fail_dispatches.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_dispatches.store(remaining - 1, Ordering::SeqCst);
                return Err(FerryError::upstream("github", "503 service unavailable"));
            }
            let inputs: Vec<String> = inputs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            self.calls.lock().unwrap().push(format!(
                "dispatch {repo} {workflow_id} {git_ref} {}",
                inputs.join(",")
            ));
            Ok(())
        }

        fn fetch_commit(&self, _: &Credential, _: &str, _: &str, sha: &str) -> FerryResult<CommitDetail> {
            Ok(CommitDetail {
                sha: sha.into(),
                message: String::new(),
                files: Vec::new(),
            })
        }
    }

    pub(crate) fn request(next_env: &str) -> PromotionRequest {
        PromotionRequest {
            repo: "api".into(),
            owner: "acme".into(),
            sha: "abc123".into(),
            source_env: "dev".into(),
            next_env: next_env.into(),
            deployment_id: "d1".into(),
            approved_by: "bo".into(),
            approved_at: "2024-05-01T10:00:00.000Z".into(),
        }
    }

    fn config_with_token(var: &str) -> FerryConfig {
        std::env::set_var(var, "tok-test");
        FerryConfig::from_json(&format!(
            r#"{{"environments": {{"test": {{"credential_env": "{var}", "deploy_role": "arn:test"}}}}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn tags_and_dispatches_with_env_credential() {
        let config = config_with_token("FERRY_PROMOTE_TEST_TOKEN_A");
        let source = FakeSource::with_deploy_workflow();
        let outcome = PromotionTrigger::new(&source, &config)
            .promote(&request("test"))
            .unwrap();
        let PromoteOutcome::Dispatched { tag, workflow_id } = outcome else {
            panic!("expected dispatch");
        };
        assert_eq!(tag, "test-1714557600000");
        assert_eq!(workflow_id, 42);
        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], format!("ref api refs/tags/{tag} abc123 tok-test"));
        assert_eq!(
            calls[1],
            format!("dispatch api 42 {tag} deploy_env=test,deploy_role=arn:test")
        );
    }

    #[test]
    fn missing_workflow_is_a_logged_noop() {
        let config = config_with_token("FERRY_PROMOTE_TEST_TOKEN_B");
        let source = FakeSource::default();
        let outcome = PromotionTrigger::new(&source, &config)
            .promote(&request("test"))
            .unwrap();
        assert_eq!(outcome, PromoteOutcome::NoWorkflow);
        assert!(source.calls().is_empty());
    }

    #[test]
    fn missing_credential_fails_before_any_call() {
        let config = FerryConfig::from_json(
            r#"{"environments": {"prod": {"credential_env": "FERRY_PROMOTE_UNSET_TOKEN_C"}}}"#,
        )
        .unwrap();
        let source = FakeSource::with_deploy_workflow();
        let err = PromotionTrigger::new(&source, &config)
            .promote(&request("prod"))
            .unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));
        assert!(source.calls().is_empty());
    }

    #[test]
    fn ref_failure_skips_dispatch() {
        let config = config_with_token("FERRY_PROMOTE_TEST_TOKEN_D");
        let source = FakeSource {
            fail_refs: true,
            ..FakeSource::with_deploy_workflow()
        };
        assert!(PromotionTrigger::new(&source, &config)
            .promote(&request("test"))
            .is_err());
        assert!(source.calls().is_empty());
    }

    #[test]
    fn retry_after_failed_dispatch_reuses_the_tag() {
        let config = config_with_token("FERRY_PROMOTE_TEST_TOKEN_E");
        let source = FakeSource {
            fail_dispatches: AtomicUsize::new(1),
            ..FakeSource::with_deploy_workflow()
        };
        let trigger = PromotionTrigger::new(&source, &config);
        let err = trigger.promote(&request("test")).unwrap_err();
        assert!(matches!(err, FerryError::UpstreamUnavailable { .. }));

        let outcome = trigger.promote(&request("test")).unwrap();
        assert_eq!(
            outcome,
            PromoteOutcome::Dispatched {
                tag: "test-1714557600000".into(),
                workflow_id: 42
            }
        );
        assert_eq!(source.refs.lock().unwrap().len(), 1);
        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].starts_with("dispatch api 42 test-1714557600000 "));
    }

    #[test]
    fn workflow_matched_by_name_or_file() {
        let source = FakeSource::with_deploy_workflow();
        assert_eq!(find_workflow(&source.workflows, "CI").unwrap().id, 1);
        assert_eq!(find_workflow(&source.workflows, "deploy-to-env").unwrap().id, 42);
        assert!(find_workflow(&source.workflows, "release").is_none());
    }
}
