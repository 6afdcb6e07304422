// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! A `.env` file is honored for local development. Everything is parsed and
//! validated once at startup.

use crate::models::{Category, ResourceType};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Where account links and time series are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Firestore,
    Memory,
}

/// How background jobs are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    CloudTasks,
    Local,
}

/// Resources to fetch per category when a notification arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions(BTreeMap<Category, Vec<String>>);

impl Subscriptions {
    /// Parse `{"category": ["resource", ...]}`, rejecting unknown entries.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            ConfigError::Invalid(format!("FITBIT_SUBSCRIPTIONS is not valid JSON: {}", e))
        })?;
        let object = value.as_object().ok_or_else(|| {
            ConfigError::Invalid("FITBIT_SUBSCRIPTIONS must be a JSON object".to_string())
        })?;

        let mut subscriptions = BTreeMap::new();
        for (name, resources) in object {
            let category: Category = name.parse().map_err(|_| {
                ConfigError::Invalid(format!("FITBIT_SUBSCRIPTIONS: unknown category {}", name))
            })?;
            let resources = resources.as_array().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "FITBIT_SUBSCRIPTIONS: resources for {} must be a list",
                    name
                ))
            })?;

            let mut names = Vec::with_capacity(resources.len());
            for resource in resources {
                let resource = resource
                    .as_str()
                    .filter(|r| ResourceType::find(category, r).is_some())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "FITBIT_SUBSCRIPTIONS: unknown resource {} in {}",
                            resource, name
                        ))
                    })?;
                names.push(resource.to_string());
            }
            subscriptions.insert(category, names);
        }

        Ok(Self(subscriptions))
    }

    /// Resource types to fetch for `category`, in catalog order.
    pub fn resources_for(&self, category: Category) -> Vec<&'static ResourceType> {
        let Some(names) = self.0.get(&category) else {
            return Vec::new();
        };
        ResourceType::in_category(category)
            .filter(|rt| names.iter().any(|n| n == rt.resource))
            .collect()
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Fitbit OAuth ---
    pub fitbit_client_id: String,
    pub fitbit_client_secret: String,

    // --- Redirects ---
    /// Where to go after linking when no `next` was given
    pub login_redirect: String,
    /// Where to go after unlinking when no `next` was given
    pub logout_redirect: String,
    /// Where to go when linking fails
    pub error_redirect: String,
    /// Host application's login page
    pub login_url: String,

    // --- Subscriptions / background fetching ---
    /// Keep data in the local store via push notifications
    pub subscribe: bool,
    pub subscriber_id: Option<String>,
    /// `None` means every resource of a notified category
    pub subscriptions: Option<Subscriptions>,
    pub verification_code: Option<String>,
    pub historical_init_delay: Duration,
    pub between_delay: Duration,
    pub fitbit_max_retries: u32,

    // --- Secrets ---
    /// JWT signing key for host session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    /// HMAC key for the OAuth `state` parameter
    pub oauth_state_key: Vec<u8>,

    // --- Deployment ---
    /// Public base URL for building the OAuth callback
    pub public_url: Option<String>,
    /// Base URL Cloud Tasks posts back to
    pub api_url: String,
    pub gcp_project_id: String,
    pub gcp_region: String,
    /// Service account Cloud Tasks signs task requests as
    pub tasks_service_account: String,
    pub storage_backend: StorageBackend,
    pub task_queue: QueueBackend,
    pub port: u16,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            fitbit_client_id: "test_client_id".to_string(),
            fitbit_client_secret: "test_secret".to_string(),
            login_redirect: "/".to_string(),
            logout_redirect: "/".to_string(),
            error_redirect: "/fitbit/error".to_string(),
            login_url: "/accounts/login/".to_string(),
            subscribe: false,
            subscriber_id: None,
            subscriptions: None,
            verification_code: Some("test_verification_code".to_string()),
            historical_init_delay: Duration::from_secs(10),
            between_delay: Duration::from_secs(5),
            fitbit_max_retries: 3,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            oauth_state_key: b"test_state_key_32_bytes_minimum!".to_vec(),
            public_url: Some("http://localhost:8080".to_string()),
            api_url: "http://localhost:8080".to_string(),
            gcp_project_id: "test-project".to_string(),
            gcp_region: "us-west1".to_string(),
            tasks_service_account: "fitlink@test-project.iam.gserviceaccount.com".to_string(),
            storage_backend: StorageBackend::Memory,
            task_queue: QueueBackend::Local,
            port: 8080,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let or_default = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let subscriptions = get("FITBIT_SUBSCRIPTIONS")
            .map(|raw| Subscriptions::parse(&raw))
            .transpose()?;
        let gcp_project_id = or_default("GCP_PROJECT_ID", "local-dev");
        let tasks_service_account = get("TASKS_SERVICE_ACCOUNT")
            .unwrap_or_else(|| format!("fitlink@{}.iam.gserviceaccount.com", gcp_project_id));

        Ok(Self {
            fitbit_client_id: required("FITBIT_CLIENT_ID")?,
            fitbit_client_secret: required("FITBIT_CLIENT_SECRET")?,
            login_redirect: or_default("FITBIT_LOGIN_REDIRECT", "/"),
            logout_redirect: or_default("FITBIT_LOGOUT_REDIRECT", "/"),
            error_redirect: or_default("FITBIT_ERROR_REDIRECT", "/fitbit/error"),
            login_url: or_default("FITBIT_LOGIN_URL", "/accounts/login/"),
            subscribe: parse_bool("FITBIT_SUBSCRIBE", get("FITBIT_SUBSCRIBE"))?,
            subscriber_id: get("FITBIT_SUBSCRIBER_ID"),
            subscriptions,
            verification_code: get("FITBIT_VERIFICATION_CODE"),
            historical_init_delay: Duration::from_secs(parse_num(
                "FITBIT_HISTORICAL_INIT_DELAY",
                get("FITBIT_HISTORICAL_INIT_DELAY"),
                10,
            )?),
            between_delay: Duration::from_secs(parse_num(
                "FITBIT_BETWEEN_DELAY",
                get("FITBIT_BETWEEN_DELAY"),
                5,
            )?),
            fitbit_max_retries: parse_num("FITBIT_MAX_RETRIES", get("FITBIT_MAX_RETRIES"), 3)?,
            jwt_signing_key: required("JWT_SIGNING_KEY")?.into_bytes(),
            oauth_state_key: required("OAUTH_STATE_KEY")?.into_bytes(),
            public_url: get("PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_url: or_default("API_URL", "http://localhost:8080"),
            gcp_project_id,
            gcp_region: or_default("GCP_REGION", "us-west1"),
            tasks_service_account,
            storage_backend: match get("STORAGE_BACKEND").as_deref() {
                None | Some("firestore") => StorageBackend::Firestore,
                Some("memory") => StorageBackend::Memory,
                Some(other) => {
                    return Err(ConfigError::Invalid(format!(
                        "STORAGE_BACKEND must be firestore or memory, got {}",
                        other
                    )))
                }
            },
            task_queue: match get("TASK_QUEUE").as_deref() {
                None | Some("cloud-tasks") => QueueBackend::CloudTasks,
                Some("local") => QueueBackend::Local,
                Some(other) => {
                    return Err(ConfigError::Invalid(format!(
                        "TASK_QUEUE must be cloud-tasks or local, got {}",
                        other
                    )))
                }
            },
            port: parse_num("PORT", get("PORT"), 8080)?,
        })
    }

    /// Resource types to fetch when a notification for `category` arrives.
    pub fn resources_for(&self, category: Category) -> Vec<&'static ResourceType> {
        match &self.subscriptions {
            Some(subscriptions) => subscriptions.resources_for(category),
            None => ResourceType::in_category(category).collect(),
        }
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid(format!(
            "{} must be a boolean, got {}",
            name, other
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(
    name: &str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got {}", name, raw))),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
