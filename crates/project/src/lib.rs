//! Stagehand project model: function definitions and per-stage/per-region
//! variables, loaded from a YAML project file.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// `${var}` tokens substituted from the stage/region variable map.
static VAR_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("variable token pattern"));

/// Declared authorizer metadata on a function. Fields this tool does not
/// interpret are kept in `extra` and forwarded to the provider untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthorizerConfig {
    #[serde(default, rename = "identitySource", skip_serializing_if = "Option::is_none")]
    pub identity_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AuthorizerConfig {
    /// An `authorizer:` block with no data at all counts as absent.
    pub fn is_empty(&self) -> bool {
        self.identity_source.is_none()
            && self.name.is_none()
            && self.auth_type.is_none()
            && self.extra.is_empty()
    }
}

/// One deployable function as declared in the project file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, rename = "customName", skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorizer: Option<AuthorizerConfig>,
}

impl FunctionDefinition {
    /// True when the function declares a non-empty authorizer block.
    pub fn wants_authorizer(&self) -> bool {
        self.authorizer.as_ref().map(|a| !a.is_empty()).unwrap_or(false)
    }

    /// Name the function is deployed under remotely.
    pub fn deployed_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }

    /// Resolve `${var}` references against the stage/region variables,
    /// returning a fully populated copy. Unresolvable tokens are left
    /// untouched and reported at debug level.
    pub fn populate(&self, vars: &BTreeMap<String, String>) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name.clone(),
            custom_name: self.custom_name.as_deref().map(|s| interpolate(s, vars)),
            authorizer: self.authorizer.as_ref().map(|a| AuthorizerConfig {
                identity_source: a.identity_source.as_deref().map(|s| interpolate(s, vars)),
                name: a.name.as_deref().map(|s| interpolate(s, vars)),
                auth_type: a.auth_type.as_deref().map(|s| interpolate(s, vars)),
                extra: a
                    .extra
                    .iter()
                    .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                    .collect(),
            }),
        }
    }
}

fn interpolate(input: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_TOKEN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match vars.get(key) {
                Some(v) => v.clone(),
                None => {
                    debug!(variable = %key, "no value for variable; leaving token in place");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn interpolate_value(v: &Value, vars: &BTreeMap<String, String>) -> Value {
    match v {
        Value::String(s) => Value::String(interpolate(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|i| interpolate_value(i, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter().map(|(k, vv)| (k.clone(), interpolate_value(vv, vars))).collect(),
        ),
        other => other.clone(),
    }
}

/// Deployment variables for one region of one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegionConfig {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl RegionConfig {
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }
}

/// A stage and the regions it deploys to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    #[serde(default)]
    pub regions: BTreeMap<String, RegionConfig>,
}

/// The whole project file: an ordered function list plus stage/region config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
}

impl Project {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading project file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing project file {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let project: Project = serde_yaml::from_str(yaml).context("parsing project YAML")?;
        if project.name.is_empty() {
            return Err(anyhow!("project is missing a name"));
        }
        Ok(project)
    }

    /// All declared functions, in file order. Reconciliation walks this
    /// sequence as-is; order is observable remotely.
    pub fn all_functions(&self) -> &[FunctionDefinition] {
        &self.functions
    }

    pub fn region(&self, stage: &str, region: &str) -> Result<&RegionConfig> {
        self.stages
            .get(stage)
            .ok_or_else(|| anyhow!("project declares no stage {}", stage))?
            .regions
            .get(region)
            .ok_or_else(|| anyhow!("stage {} declares no region {}", stage, region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT_YAML: &str = r#"
name: orders
functions:
  - name: list-orders
  - name: auth
    customName: orders-${stage}-auth
    authorizer:
      identitySource: method.request.header.Authorization
      authorizerResultTtlInSeconds: 300
stages:
  dev:
    regions:
      us-east-1:
        variables:
          stage: dev
          iamRoleArnLambda: arn:aws:iam::123456789012:role/orders
"#;

    #[test]
    fn parses_project_yaml() {
        let p = Project::from_yaml(PROJECT_YAML).expect("parse");
        assert_eq!(p.name, "orders");
        assert_eq!(p.all_functions().len(), 2);
        assert!(!p.functions[0].wants_authorizer());
        assert!(p.functions[1].wants_authorizer());
        let vars = p.region("dev", "us-east-1").expect("region").variables();
        assert_eq!(vars.get("stage").map(String::as_str), Some("dev"));
    }

    #[test]
    fn missing_stage_and_region_are_named_in_errors() {
        let p = Project::from_yaml(PROJECT_YAML).expect("parse");
        let e = p.region("prod", "us-east-1").unwrap_err().to_string();
        assert!(e.contains("no stage prod"), "e={}", e);
        let e = p.region("dev", "eu-west-1").unwrap_err().to_string();
        assert!(e.contains("no region eu-west-1"), "e={}", e);
    }

    #[test]
    fn empty_authorizer_block_counts_as_absent() {
        let p = Project::from_yaml(
            "name: x\nfunctions:\n  - name: f\n    authorizer: {}\n",
        )
        .expect("parse");
        assert!(!p.functions[0].wants_authorizer());
    }

    #[test]
    fn populate_substitutes_variables() {
        let p = Project::from_yaml(PROJECT_YAML).expect("parse");
        let vars = p.region("dev", "us-east-1").unwrap().variables();
        let f = p.functions[1].populate(vars);
        assert_eq!(f.custom_name.as_deref(), Some("orders-dev-auth"));
        assert_eq!(f.deployed_name(), "orders-dev-auth");
        // Untouched fields survive the round trip.
        let auth = f.authorizer.expect("authorizer");
        assert_eq!(
            auth.identity_source.as_deref(),
            Some("method.request.header.Authorization")
        );
        assert_eq!(
            auth.extra.get("authorizerResultTtlInSeconds").and_then(Value::as_i64),
            Some(300)
        );
    }

    #[test]
    fn populate_reaches_nested_passthrough_values() {
        let p = Project::from_yaml(
            "name: x\nfunctions:\n  - name: f\n    authorizer:\n      identitySource: ${source}\n      providerARNs:\n        - arn:aws:cognito:${stage}\n",
        )
        .expect("parse");
        let mut vars = BTreeMap::new();
        vars.insert("source".to_string(), "method.request.header.Auth".to_string());
        vars.insert("stage".to_string(), "dev".to_string());
        let auth = p.functions[0].populate(&vars).authorizer.expect("authorizer");
        assert_eq!(auth.identity_source.as_deref(), Some("method.request.header.Auth"));
        assert_eq!(
            auth.extra.get("providerARNs"),
            Some(&serde_json::json!(["arn:aws:cognito:dev"]))
        );
    }

    #[test]
    fn unresolved_tokens_are_left_in_place() {
        let mut vars = BTreeMap::new();
        vars.insert("known".to_string(), "yes".to_string());
        assert_eq!(interpolate("${known}-${unknown}", &vars), "yes-${unknown}");
    }

    #[test]
    fn nameless_project_is_rejected() {
        assert!(Project::from_yaml("name: \"\"\n").is_err());
    }
}
