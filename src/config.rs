//! Static configuration of a stack.
//!
//! A [`StackConfig`] is read from JSON and the environment, then validated
//! once into an immutable [`Settings`] value that is handed to graph
//! construction.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::KumoError;
use crate::retry::{RetryPolicy, RetrySettings};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub name: Option<String>,
    pub region: Option<String>,
    pub account_id: Option<String>,
    pub cognito_user_pool_id: Option<String>,
    pub cognito_client_id: Option<String>,
    pub docker_registry_username: Option<String>,
    pub github_token: Option<String>,
    pub ingress: IngressSettings,
    pub run: RunSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngressSettings {
    /// Literal prefix the controller puts in front of internal load balancer
    /// hostnames.
    pub load_balancer_prefix: String,
    pub listener_port: u16,
    pub namespace: String,
    pub name: String,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            load_balancer_prefix: "internal-".into(),
            listener_port: 80,
            namespace: "afj-test-app".into(),
            name: "afj-test-ingress-pulumi".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Wall-clock limit for the whole run, unlimited if unset.
    pub timeout_secs: Option<u64>,
    pub lookup: RetrySettings,
}

/// Validated, immutable configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub name: String,
    pub region: String,
    pub account_id: Option<String>,
    pub cognito_user_pool_id: String,
    pub cognito_client_id: String,
    pub docker_registry_username: String,
    pub github_token: String,
    pub ingress: IngressSettings,
    pub timeout: Option<Duration>,
    pub lookup: RetryPolicy,
}

impl Settings {
    /// Issuer of the JWTs the API gateway accepts.
    pub fn jwt_issuer(&self) -> String {
        format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            self.region, self.cognito_user_pool_id
        )
    }
}

impl StackConfig {
    pub fn from_json(text: &str) -> Result<Self, KumoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KumoError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Fills the fields from environment variables where set, taking
    /// precedence over the file.
    pub fn overlay_env(self) -> Self {
        self.overlay(|key| std::env::var(key).ok())
    }

    /// Like [`StackConfig::overlay_env`], reading variables through `var`.
    pub fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let fields = [
            ("STACK_NAME", &mut self.name),
            ("AWS_REGION", &mut self.region),
            ("AWS_ACCOUNT_ID", &mut self.account_id),
            ("AWS_COGNITO_USER_POOL_ID", &mut self.cognito_user_pool_id),
            ("AWS_COGNITO_CLIENT_ID", &mut self.cognito_client_id),
            ("DOCKER_REGISTRY_USERNAME", &mut self.docker_registry_username),
            ("GITHUB_TOKEN", &mut self.github_token),
        ];

        for (key, field) in fields {
            if let Some(value) = var(key).filter(|value| !value.is_empty()) {
                *field = Some(value);
            }
        }
        self
    }

    /// Checks that every required value is present.
    pub fn resolve(self) -> Result<Settings, KumoError> {
        fn required(value: Option<String>, key: &str) -> Result<String, KumoError> {
            value
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| KumoError::Configuration(key.to_owned()))
        }

        Ok(Settings {
            name: self.name.unwrap_or_else(|| String::from("veridid")),
            region: required(self.region, "AWS_REGION")?,
            account_id: self.account_id,
            cognito_user_pool_id: required(self.cognito_user_pool_id, "AWS_COGNITO_USER_POOL_ID")?,
            cognito_client_id: required(self.cognito_client_id, "AWS_COGNITO_CLIENT_ID")?,
            docker_registry_username: required(self.docker_registry_username, "DOCKER_REGISTRY_USERNAME")?,
            github_token: required(self.github_token, "GITHUB_TOKEN")?,
            ingress: self.ingress,
            timeout: self.run.timeout_secs.map(Duration::from_secs),
            lookup: RetryPolicy::try_from(&self.run.lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FULL: &str = r#"{
        "region": "ca-central-1",
        "cognito_user_pool_id": "ca-central-1_AbCdEf",
        "cognito_client_id": "client",
        "docker_registry_username": "veridid",
        "github_token": "ghp_secret",
        "run": { "timeout_secs": 1800, "lookup": { "max_attempts": 8 } }
    }"#;

    #[test]
    fn test_resolve_with_defaults() {
        let settings = StackConfig::from_json(FULL).unwrap().resolve().unwrap();

        assert_eq!(settings.name, "veridid");
        assert_eq!(settings.ingress, IngressSettings::default());
        assert_eq!(settings.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(settings.lookup.max_attempts, 8);
        assert_eq!(settings.lookup.base_delay, Duration::from_secs(2));
        assert_eq!(
            settings.jwt_issuer(),
            "https://cognito-idp.ca-central-1.amazonaws.com/ca-central-1_AbCdEf"
        );
    }

    #[test]
    fn test_missing_value_is_configuration_error() {
        let config = StackConfig::from_json(r#"{ "region": "ca-central-1" }"#).unwrap();

        match config.resolve() {
            Err(KumoError::Configuration(key)) => assert_eq!(key, "AWS_COGNITO_USER_POOL_ID"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_environment_takes_precedence() {
        let env = HashMap::from([
            ("AWS_REGION", "us-east-1"),
            ("STACK_NAME", "staging"),
            ("AWS_COGNITO_CLIENT_ID", ""),
        ]);

        let settings = StackConfig::from_json(FULL)
            .unwrap()
            .overlay(|key| env.get(key).map(|value| value.to_string()))
            .resolve()
            .unwrap();

        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.name, "staging");
        assert_eq!(settings.cognito_client_id, "client");
    }

    #[test]
    fn test_invalid_retry_settings_rejected_before_scheduling() {
        let json = FULL.replace(r#""max_attempts": 8"#, r#""max_attempts": 8, "multiplier": -2.0"#);

        match StackConfig::from_json(&json).unwrap().resolve() {
            Err(KumoError::InvalidConfiguration { key, .. }) => assert_eq!(key, "lookup.multiplier"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            StackConfig::from_json("{ region: 1 }"),
            Err(KumoError::ConfigParse(_))
        ));
    }
}
