//! Stagehand provider gateway: the remote API Gateway/Lambda calls the
//! deployer issues, behind one trait so hosts and tests can swap transports.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use stagehand_core::{AuthorizerSpec, Deployment, DeploymentRequest, RemoteAuthorizer};

mod aws;

pub use aws::AwsProvider;

/// First-page size for authorizer listings. Listing never paginates past the
/// first page; APIs with more authorizers than this are out of scope.
pub const AUTHORIZER_PAGE_LIMIT: i32 = 100;

/// Provider call failures. `Throttled` is the only variant callers may
/// recover from; everything else is terminal for the invocation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by remote API")]
    Throttled,
    #[error("function not found: {0}")]
    FunctionNotFound(String),
    #[error("{0}")]
    Api(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Remote request gateway used by the deployer: one method per operation
/// kind. Implementations own connections and auth; retry policy stays with
/// the caller.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// List the authorizers currently on the REST API (first page only).
    async fn list_authorizers(&self, rest_api_id: &str) -> ProviderResult<Vec<RemoteAuthorizer>>;

    async fn delete_authorizer(&self, rest_api_id: &str, authorizer_id: &str) -> ProviderResult<()>;

    /// Existence check for a stage-qualified function. The metadata itself
    /// is not consumed.
    async fn get_function(&self, function_name: &str, qualifier: &str) -> ProviderResult<()>;

    async fn create_authorizer(&self, spec: &AuthorizerSpec) -> ProviderResult<RemoteAuthorizer>;

    async fn create_deployment(&self, request: &DeploymentRequest) -> ProviderResult<Deployment>;
}

// ----------------- Recording mock -----------------

/// One remote call as observed by [`RecordingProvider`], in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ListAuthorizers { rest_api_id: String },
    DeleteAuthorizer { rest_api_id: String, authorizer_id: String },
    GetFunction { function_name: String, qualifier: String },
    CreateAuthorizer { spec: AuthorizerSpec },
    CreateDeployment { request: DeploymentRequest },
}

impl RecordedCall {
    pub fn is_deployment(&self) -> bool {
        matches!(self, RecordedCall::CreateDeployment { .. })
    }
}

/// Scripted in-memory provider for tests. Records every call in order,
/// serves a configured pre-existing authorizer set, and pops scripted
/// create-deployment outcomes from a queue (empty queue means success).
#[derive(Default)]
pub struct RecordingProvider {
    pub calls: Mutex<Vec<RecordedCall>>,
    pub existing_authorizers: Vec<RemoteAuthorizer>,
    /// Authorizer id whose deletion fails, if any.
    pub fail_delete: Option<String>,
    /// Function names the fake region does not know.
    pub missing_functions: Vec<String>,
    pub deployment_outcomes: Mutex<VecDeque<ProviderResult<Deployment>>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_authorizers(mut self, authorizers: Vec<RemoteAuthorizer>) -> Self {
        self.existing_authorizers = authorizers;
        self
    }

    pub fn with_deployment_outcomes(self, outcomes: Vec<ProviderResult<Deployment>>) -> Self {
        *self.deployment_outcomes.lock().unwrap() = outcomes.into();
        self
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProviderGateway for RecordingProvider {
    async fn list_authorizers(&self, rest_api_id: &str) -> ProviderResult<Vec<RemoteAuthorizer>> {
        self.record(RecordedCall::ListAuthorizers { rest_api_id: rest_api_id.to_string() });
        Ok(self.existing_authorizers.clone())
    }

    async fn delete_authorizer(&self, rest_api_id: &str, authorizer_id: &str) -> ProviderResult<()> {
        self.record(RecordedCall::DeleteAuthorizer {
            rest_api_id: rest_api_id.to_string(),
            authorizer_id: authorizer_id.to_string(),
        });
        if self.fail_delete.as_deref() == Some(authorizer_id) {
            return Err(ProviderError::Api(format!("cannot delete authorizer {}", authorizer_id)));
        }
        Ok(())
    }

    async fn get_function(&self, function_name: &str, qualifier: &str) -> ProviderResult<()> {
        self.record(RecordedCall::GetFunction {
            function_name: function_name.to_string(),
            qualifier: qualifier.to_string(),
        });
        if self.missing_functions.iter().any(|f| f == function_name) {
            return Err(ProviderError::FunctionNotFound(function_name.to_string()));
        }
        Ok(())
    }

    async fn create_authorizer(&self, spec: &AuthorizerSpec) -> ProviderResult<RemoteAuthorizer> {
        self.record(RecordedCall::CreateAuthorizer { spec: spec.clone() });
        Ok(RemoteAuthorizer { id: format!("auth-{}", spec.name), name: Some(spec.name.clone()) })
    }

    async fn create_deployment(&self, request: &DeploymentRequest) -> ProviderResult<Deployment> {
        self.record(RecordedCall::CreateDeployment { request: request.clone() });
        match self.deployment_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(Deployment { id: "dep-1".to_string(), created_ts: None }),
        }
    }
}
