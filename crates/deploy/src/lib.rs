//! Stagehand region deployer: reconciles request authorizers and creates the
//! stage deployment for a single region. Multi-region fan-out belongs to the
//! caller; this crate handles exactly one region per invocation.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use stagehand_core::{
    authorizer_uri, AuthorizerSpec, Deployment, DeploymentRequest, DeployOptions,
    InvocationContext, IAM_ROLE_VARIABLE,
};
use stagehand_project::Project;
use stagehand_provider::{ProviderError, ProviderGateway};
use tracing::{debug, info};

/// Deploy failures surfaced to the invoking orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The project declares something this tool cannot work with.
    #[error("configuration: {0}")]
    Configuration(String),
    /// A remote call failed for a reason other than rate limiting.
    #[error("remote call failed: {0}")]
    Remote(String),
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Outcome of a region deploy. The created deployment's identifier is the
/// only state handed back; the real output is the remote side effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub deployment_id: String,
}

fn remote(e: ProviderError) -> DeployError {
    DeployError::Remote(e.to_string())
}

fn retry_delay() -> Duration {
    let secs = std::env::var("STAGEHAND_DEPLOY_RETRY_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60);
    Duration::from_secs(secs)
}

/// Resolve a full invocation context from the project's region variables.
pub fn resolve_context(project: &Project, opts: DeployOptions) -> DeployResult<InvocationContext> {
    let region = project
        .region(&opts.stage, &opts.region)
        .map_err(|e| DeployError::Configuration(e.to_string()))?;
    let role = region.variables().get(IAM_ROLE_VARIABLE).ok_or_else(|| {
        DeployError::Configuration(format!(
            "stage {} region {} declares no {} variable",
            opts.stage, opts.region, IAM_ROLE_VARIABLE
        ))
    })?;
    InvocationContext::new(opts, role).map_err(|e| DeployError::Configuration(e.to_string()))
}

/// Drives both phases for one region against a provider gateway.
pub struct RegionDeployer<'a, G> {
    gateway: &'a G,
    retry_delay: Duration,
}

impl<'a, G: ProviderGateway> RegionDeployer<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway, retry_delay: retry_delay() }
    }

    /// Authorizer reconciliation first, then the stage deployment. The
    /// deployment snapshot must reflect the final authorizer set, so the
    /// reconciler fully completes before the deployment request goes out.
    pub async fn deploy(&self, project: &Project, cx: &InvocationContext) -> DeployResult<DeployOutcome> {
        let t0 = std::time::Instant::now();
        counter!("deploy_attempts", 1u64);
        self.reconcile_authorizers(project, cx).await?;
        let deployment = self.create_deployment(cx).await?;
        histogram!("deploy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("deploy_ok", 1u64);
        info!(
            stage = %cx.stage,
            region = %cx.region,
            deployment = %deployment.id,
            "created API Gateway deployment"
        );
        Ok(DeployOutcome { deployment_id: deployment.id })
    }

    /// Replace the remote authorizer set with one authorizer per function
    /// that declares authorizer metadata. Every listed authorizer is deleted
    /// unconditionally (full replace, not diff-by-key); the first failure
    /// aborts the whole pass.
    async fn reconcile_authorizers(&self, project: &Project, cx: &InvocationContext) -> DeployResult<()> {
        let existing = self.gateway.list_authorizers(&cx.rest_api_id).await.map_err(remote)?;
        debug!(rest_api_id = %cx.rest_api_id, count = existing.len(), "reconciling authorizers");
        for auth in &existing {
            self.gateway.delete_authorizer(&cx.rest_api_id, &auth.id).await.map_err(remote)?;
            counter!("authorizers_deleted_total", 1u64);
        }

        let vars = project
            .region(&cx.stage, &cx.region)
            .map_err(|e| DeployError::Configuration(e.to_string()))?
            .variables();
        for function in project.all_functions() {
            if !function.wants_authorizer() {
                continue;
            }
            let function = function.populate(vars);
            let Some(auth) = function.authorizer.clone() else { continue };

            // The fetch only confirms the stage-qualified function exists.
            self.gateway.get_function(function.deployed_name(), &cx.stage).await.map_err(remote)?;

            let identity_source = auth.identity_source.ok_or_else(|| {
                DeployError::Configuration(format!(
                    "authorizer for function {} is missing identitySource",
                    function.name
                ))
            })?;
            let spec = AuthorizerSpec {
                rest_api_id: cx.rest_api_id.clone(),
                name: auth
                    .name
                    .or_else(|| function.custom_name.clone())
                    .unwrap_or_else(|| function.name.clone()),
                auth_type: auth.auth_type.unwrap_or_else(|| "TOKEN".to_string()),
                identity_source,
                authorizer_uri: authorizer_uri(
                    &cx.region,
                    &cx.aws_account_number,
                    function.deployed_name(),
                    &cx.stage,
                ),
                extra: auth.extra,
            };
            self.gateway.create_authorizer(&spec).await.map_err(remote)?;
            counter!("authorizers_created_total", 1u64);
            debug!(function = %function.name, authorizer = %spec.name, "created authorizer");
        }
        Ok(())
    }

    /// Create the stage deployment, retrying on throttling with a fixed
    /// delay. Only the throttling signal retries; any other failure is
    /// terminal. A persistent throttle keeps this loop waiting indefinitely.
    async fn create_deployment(&self, cx: &InvocationContext) -> DeployResult<Deployment> {
        let request = DeploymentRequest::for_context(cx);
        loop {
            match self.gateway.create_deployment(&request).await {
                Ok(deployment) => return Ok(deployment),
                Err(ProviderError::Throttled) => {
                    counter!("deploy_throttled_total", 1u64);
                    debug!(
                        stage = %cx.stage,
                        region = %cx.region,
                        delay_secs = self.retry_delay.as_secs(),
                        "deployment throttled; waiting before retry"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(DeployError::Remote(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{Deployment, RemoteAuthorizer, DEFAULT_DEPLOY_DESCRIPTION};
    use stagehand_provider::{RecordedCall, RecordingProvider};

    const PROJECT_YAML: &str = r#"
name: orders
functions:
  - name: auth
    customName: orders-auth
    authorizer:
      identitySource: method.request.header.Auth
  - name: list-orders
stages:
  dev:
    regions:
      us-east-1:
        variables:
          iamRoleArnLambda: arn:aws:iam::123456789012:role/orders
"#;

    fn project() -> Project {
        Project::from_yaml(PROJECT_YAML).expect("project")
    }

    fn options() -> DeployOptions {
        DeployOptions {
            stage: "dev".into(),
            region: "us-east-1".into(),
            rest_api_id: "api123".into(),
            description: None,
        }
    }

    fn context(project: &Project) -> InvocationContext {
        resolve_context(project, options()).expect("context")
    }

    fn deployer<G: ProviderGateway>(gateway: &G) -> RegionDeployer<'_, G> {
        RegionDeployer { gateway, retry_delay: Duration::from_secs(60) }
    }

    #[test]
    fn resolve_context_derives_account_number() {
        let p = project();
        let cx = context(&p);
        assert_eq!(cx.aws_account_number, "123456789012");
    }

    #[test]
    fn resolve_context_requires_role_variable() {
        let p = Project::from_yaml(
            "name: x\nstages:\n  dev:\n    regions:\n      us-east-1:\n        variables: {}\n",
        )
        .unwrap();
        let err = resolve_context(&p, options()).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(msg) if msg.contains("iamRoleArnLambda")));
    }

    #[tokio::test]
    async fn reconciliation_replaces_the_authorizer_set() {
        let gw = RecordingProvider::new().with_existing_authorizers(vec![
            RemoteAuthorizer { id: "old-1".into(), name: None },
            RemoteAuthorizer { id: "old-2".into(), name: None },
        ]);
        let p = project();
        let cx = context(&p);
        deployer(&gw).deploy(&p, &cx).await.expect("deploy");

        let calls = gw.recorded();
        assert_eq!(calls[0], RecordedCall::ListAuthorizers { rest_api_id: "api123".into() });
        assert_eq!(
            calls[1],
            RecordedCall::DeleteAuthorizer { rest_api_id: "api123".into(), authorizer_id: "old-1".into() }
        );
        assert_eq!(
            calls[2],
            RecordedCall::DeleteAuthorizer { rest_api_id: "api123".into(), authorizer_id: "old-2".into() }
        );
        assert_eq!(
            calls[3],
            RecordedCall::GetFunction { function_name: "orders-auth".into(), qualifier: "dev".into() }
        );
        let RecordedCall::CreateAuthorizer { spec } = &calls[4] else {
            panic!("expected create authorizer, got {:?}", calls[4]);
        };
        assert_eq!(spec.name, "orders-auth");
        assert_eq!(spec.auth_type, "TOKEN");
        assert_eq!(spec.identity_source, "method.request.header.Auth");
        assert_eq!(
            spec.authorizer_uri,
            "arn:aws:apigateway:us-east-1:lambda:path/2015-03-31/functions/arn:aws:lambda:us-east-1:123456789012:function:orders-auth:dev/invocations"
        );
        // One authorizer-bearing function, exactly one create.
        assert_eq!(calls.iter().filter(|c| matches!(c, RecordedCall::CreateAuthorizer { .. })).count(), 1);
    }

    #[tokio::test]
    async fn missing_identity_source_aborts_before_any_deployment() {
        let gw = RecordingProvider::new();
        let p = Project::from_yaml(
            r#"
name: orders
functions:
  - name: auth
    authorizer:
      name: broken
stages:
  dev:
    regions:
      us-east-1:
        variables:
          iamRoleArnLambda: arn:aws:iam::123456789012:role/orders
"#,
        )
        .unwrap();
        let cx = context(&p);
        let err = deployer(&gw).deploy(&p, &cx).await.unwrap_err();
        assert!(matches!(&err, DeployError::Configuration(msg) if msg.contains("auth")));
        assert!(matches!(&err, DeployError::Configuration(msg) if msg.contains("identitySource")));
        assert_eq!(gw.recorded().iter().filter(|c| c.is_deployment()).count(), 0);
    }

    #[tokio::test]
    async fn delete_failure_aborts_reconciliation() {
        let mut gw = RecordingProvider::new().with_existing_authorizers(vec![
            RemoteAuthorizer { id: "old-1".into(), name: None },
            RemoteAuthorizer { id: "old-2".into(), name: None },
        ]);
        gw.fail_delete = Some("old-1".into());
        let p = project();
        let cx = context(&p);
        let err = deployer(&gw).deploy(&p, &cx).await.unwrap_err();
        assert!(matches!(err, DeployError::Remote(_)));
        let calls = gw.recorded();
        // First delete failed: no second delete, no creates, no deployment.
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| !c.is_deployment()));
    }

    #[tokio::test]
    async fn deployment_failure_does_not_retry() {
        let gw = RecordingProvider::new()
            .with_deployment_outcomes(vec![Err(ProviderError::Api("access denied".into()))]);
        let p = project();
        let cx = context(&p);
        let err = deployer(&gw).deploy(&p, &cx).await.unwrap_err();
        assert!(matches!(&err, DeployError::Remote(msg) if msg.contains("access denied")));
        assert_eq!(gw.recorded().iter().filter(|c| c.is_deployment()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_deployment_retries_every_sixty_seconds() {
        let gw = RecordingProvider::new().with_deployment_outcomes(vec![
            Err(ProviderError::Throttled),
            Err(ProviderError::Throttled),
            Ok(Deployment { id: "dep-42".into(), created_ts: None }),
        ]);
        let p = project();
        let cx = context(&p);
        let t0 = tokio::time::Instant::now();
        let outcome = deployer(&gw).deploy(&p, &cx).await.expect("deploy");
        assert_eq!(outcome.deployment_id, "dep-42");
        assert_eq!(t0.elapsed(), Duration::from_secs(120));
        assert_eq!(gw.recorded().iter().filter(|c| c.is_deployment()).count(), 3);
    }

    #[tokio::test]
    async fn deployment_goes_out_strictly_after_reconciliation() {
        let gw = RecordingProvider::new().with_existing_authorizers(vec![RemoteAuthorizer {
            id: "old-1".into(),
            name: None,
        }]);
        let p = project();
        let cx = context(&p);
        deployer(&gw).deploy(&p, &cx).await.expect("deploy");
        let calls = gw.recorded();
        let deployment_pos = calls.iter().position(RecordedCall::is_deployment).expect("deployment");
        assert_eq!(deployment_pos, calls.len() - 1);
        assert!(calls[..deployment_pos].iter().all(|c| !c.is_deployment()));
    }

    #[tokio::test]
    async fn end_to_end_two_functions_one_authorizer() {
        let gw = RecordingProvider::new().with_deployment_outcomes(vec![Ok(Deployment {
            id: "dep-e2e".into(),
            created_ts: None,
        })]);
        let p = project();
        let cx = context(&p);
        let outcome = deployer(&gw).deploy(&p, &cx).await.expect("deploy");
        assert_eq!(outcome.deployment_id, "dep-e2e");

        let calls = gw.recorded();
        assert_eq!(calls.iter().filter(|c| matches!(c, RecordedCall::CreateAuthorizer { .. })).count(), 1);
        let RecordedCall::CreateDeployment { request } = calls.last().unwrap() else {
            panic!("expected deployment last, got {:?}", calls.last());
        };
        assert_eq!(request.stage_name, "dev");
        assert_eq!(request.description, DEFAULT_DEPLOY_DESCRIPTION);
        assert_eq!(request.variables.get("functionAlias").map(String::as_str), Some("dev"));
    }
}
