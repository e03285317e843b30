//! AWS-backed provider: region-pinned API Gateway and Lambda SDK clients.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_apigateway::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_apigateway::types::AuthorizerType;
use serde_json::Value;
use tracing::{debug, warn};

use async_trait::async_trait;
use stagehand_core::{AuthorizerSpec, Deployment, DeploymentRequest, RemoteAuthorizer};

use crate::{ProviderError, ProviderGateway, ProviderResult, AUTHORIZER_PAGE_LIMIT};

/// Throttling surfaces as this error code on every gateway operation.
const THROTTLE_CODE: &str = "TooManyRequestsException";

/// Gateway implementation backed by the official SDK clients.
pub struct AwsProvider {
    apigateway: aws_sdk_apigateway::Client,
    lambda: aws_sdk_lambda::Client,
}

impl AwsProvider {
    /// Build clients for one region from the ambient credential chain.
    pub async fn connect(region: &str) -> Self {
        let conf = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            apigateway: aws_sdk_apigateway::Client::new(&conf),
            lambda: aws_sdk_lambda::Client::new(&conf),
        }
    }
}

fn map_sdk_err<E>(err: SdkError<E>, what: &str) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let Some(service) = err.as_service_error() {
        if service.code() == Some(THROTTLE_CODE) {
            return ProviderError::Throttled;
        }
        if let Some(msg) = service.message() {
            return ProviderError::Api(format!("{}: {}", what, msg));
        }
    }
    ProviderError::Api(format!("{}: {}", what, err))
}

#[async_trait]
impl ProviderGateway for AwsProvider {
    async fn list_authorizers(&self, rest_api_id: &str) -> ProviderResult<Vec<RemoteAuthorizer>> {
        let out = self
            .apigateway
            .get_authorizers()
            .rest_api_id(rest_api_id)
            .limit(AUTHORIZER_PAGE_LIMIT)
            .send()
            .await
            .map_err(|e| map_sdk_err(e, "listing authorizers"))?;
        let items = out.items.unwrap_or_default();
        debug!(rest_api_id = %rest_api_id, count = items.len(), "listed authorizers");
        Ok(items
            .into_iter()
            .filter_map(|a| a.id.map(|id| RemoteAuthorizer { id, name: a.name }))
            .collect())
    }

    async fn delete_authorizer(&self, rest_api_id: &str, authorizer_id: &str) -> ProviderResult<()> {
        self.apigateway
            .delete_authorizer()
            .rest_api_id(rest_api_id)
            .authorizer_id(authorizer_id)
            .send()
            .await
            .map_err(|e| map_sdk_err(e, "deleting authorizer"))?;
        Ok(())
    }

    async fn get_function(&self, function_name: &str, qualifier: &str) -> ProviderResult<()> {
        self.lambda
            .get_function()
            .function_name(function_name)
            .qualifier(qualifier)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false);
                if not_found {
                    return ProviderError::FunctionNotFound(function_name.to_string());
                }
                map_sdk_err(e, "fetching function")
            })?;
        Ok(())
    }

    async fn create_authorizer(&self, spec: &AuthorizerSpec) -> ProviderResult<RemoteAuthorizer> {
        let mut req = self
            .apigateway
            .create_authorizer()
            .rest_api_id(&spec.rest_api_id)
            .name(&spec.name)
            .r#type(AuthorizerType::from(spec.auth_type.as_str()))
            .identity_source(&spec.identity_source)
            .authorizer_uri(&spec.authorizer_uri);
        for (key, value) in &spec.extra {
            req = match (key.as_str(), value) {
                ("authorizerCredentials", Value::String(v)) => req.authorizer_credentials(v),
                ("identityValidationExpression", Value::String(v)) => {
                    req.identity_validation_expression(v)
                }
                ("authorizerResultTtlInSeconds", v) if v.as_i64().is_some() => {
                    req.authorizer_result_ttl_in_seconds(v.as_i64().unwrap_or_default() as i32)
                }
                _ => {
                    warn!(field = %key, "ignoring unsupported authorizer field");
                    req
                }
            };
        }
        let out = req.send().await.map_err(|e| map_sdk_err(e, "creating authorizer"))?;
        let id = out
            .id
            .ok_or_else(|| ProviderError::Api("authorizer response missing id".to_string()))?;
        Ok(RemoteAuthorizer { id, name: out.name })
    }

    async fn create_deployment(&self, request: &DeploymentRequest) -> ProviderResult<Deployment> {
        let mut req = self
            .apigateway
            .create_deployment()
            .rest_api_id(&request.rest_api_id)
            .stage_name(&request.stage_name)
            .description(&request.description)
            .stage_description(&request.stage_description);
        for (k, v) in &request.variables {
            req = req.variables(k, v);
        }
        let out = req.send().await.map_err(|e| map_sdk_err(e, "creating deployment"))?;
        let id = out
            .id
            .ok_or_else(|| ProviderError::Api("deployment response missing id".to_string()))?;
        Ok(Deployment { id, created_ts: out.created_date.map(|d| d.secs()) })
    }
}
