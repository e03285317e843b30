//! Stagehand core types: invocation context, derived authorizer/deployment
//! records, and the pure parsing helpers shared by the other crates.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Fixed description recorded on a deployment when the caller supplies none.
pub const DEFAULT_DEPLOY_DESCRIPTION: &str = "Stagehand deployment";

/// Stage variable key carrying the Lambda execution role ARN for a region.
pub const IAM_ROLE_VARIABLE: &str = "iamRoleArnLambda";

/// Caller-supplied options for one single-region deploy invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployOptions {
    pub stage: String,
    pub region: String,
    pub rest_api_id: String,
    pub description: Option<String>,
}

/// Fully resolved invocation context: the caller's options plus the AWS
/// account number derived from the region's Lambda IAM role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationContext {
    pub stage: String,
    pub region: String,
    pub rest_api_id: String,
    pub description: Option<String>,
    pub aws_account_number: String,
}

impl InvocationContext {
    /// Build a context from deploy options and the region's Lambda role ARN.
    /// Fails when the ARN does not carry a recognizable account number.
    pub fn new(opts: DeployOptions, iam_role_arn_lambda: &str) -> Result<Self> {
        let aws_account_number = parse_account_number(iam_role_arn_lambda)?;
        Ok(Self {
            stage: opts.stage,
            region: opts.region,
            rest_api_id: opts.rest_api_id,
            description: opts.description,
            aws_account_number,
        })
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(DEFAULT_DEPLOY_DESCRIPTION)
    }
}

/// Extract the account number from an IAM role ARN of the form
/// `arn:aws:iam::123456789012:role/...`.
///
/// Malformed input is an explicit error, never a silently wrong account
/// number baked into an invocation URI.
pub fn parse_account_number(role_arn: &str) -> Result<String> {
    let rest = role_arn
        .strip_prefix("arn:aws:iam::")
        .ok_or_else(|| anyhow!("unexpected IAM role ARN: {}", role_arn))?;
    let account = rest.split(':').next().unwrap_or("");
    if account.is_empty() || !account.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("IAM role ARN carries no account number: {}", role_arn));
    }
    Ok(account.to_string())
}

/// Invocation URI for a stage-qualified Lambda authorizer, in the shape the
/// gateway service expects.
pub fn authorizer_uri(region: &str, account_number: &str, function_name: &str, stage: &str) -> String {
    format!(
        "arn:aws:apigateway:{}:lambda:path/2015-03-31/functions/arn:aws:lambda:{}:{}:function:{}:{}/invocations",
        region, region, account_number, function_name, stage
    )
}

/// Parameters for creating one request authorizer on a REST API. Derived per
/// function per invocation; its only destination is the create call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizerSpec {
    pub rest_api_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub identity_source: String,
    pub authorizer_uri: String,
    /// Declared fields this tool does not interpret; forwarded untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A deployment request for one API/stage pair. Built once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub rest_api_id: String,
    pub stage_name: String,
    pub description: String,
    pub stage_description: String,
    pub variables: BTreeMap<String, String>,
}

impl DeploymentRequest {
    /// The one request shape this tool submits: stage description mirrors the
    /// stage name and `functionAlias` pins stage-qualified Lambda aliases.
    pub fn for_context(cx: &InvocationContext) -> Self {
        let mut variables = BTreeMap::new();
        variables.insert("functionAlias".to_string(), cx.stage.clone());
        Self {
            rest_api_id: cx.rest_api_id.clone(),
            stage_name: cx.stage.clone(),
            description: cx.description().to_string(),
            stage_description: cx.stage.clone(),
            variables,
        }
    }
}

/// Remote authorizer as returned by the listing call. Listed authorizers are
/// deleted unconditionally; only `id` is consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAuthorizer {
    pub id: String,
    pub name: Option<String>,
}

/// Remote deployment record; `id` is the only field surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    /// Creation time (seconds since epoch) when the remote response had one.
    pub created_ts: Option<i64>,
}
