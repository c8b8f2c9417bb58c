use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Secret type recorded in every lease handed to the host.
pub const SECRET_TYPE: &str = "datadog_keys";

pub const DEFAULT_ROLE_TTL_SECS: u64 = 3600;
pub const DEFAULT_ROLE_MAX_TTL_SECS: u64 = 86_400;

static ROLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w(([\w\-.]+)?\w)?$").expect("role name pattern compiles"));

/// Admin credentials the engine uses to authenticate against Datadog.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub app_key: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"<redacted>")
            .field("app_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyType {
    #[serde(rename = "api_key")]
    Api,
    #[serde(rename = "app_key")]
    App,
    #[serde(rename = "both")]
    Both,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Api => "api_key",
            KeyType::App => "app_key",
            KeyType::Both => "both",
        }
    }

    pub fn includes_api(&self) -> bool {
        matches!(self, KeyType::Api | KeyType::Both)
    }

    pub fn includes_app(&self) -> bool {
        matches!(self, KeyType::App | KeyType::Both)
    }
}

impl FromStr for KeyType {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "api_key" => Ok(KeyType::Api),
            "app_key" => Ok(KeyType::App),
            "both" => Ok(KeyType::Both),
            other => Err(EngineError::InvalidKeyType(other.to_string())),
        }
    }
}

/// Stored role definition. The name is the storage key and is not part of the
/// persisted body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    #[serde(skip)]
    pub name: String,
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    pub ttl: u64,
    pub max_ttl: u64,
}

impl Role {
    /// Checks the rules a role must satisfy before it is persisted.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_role_name(&self.name)?;
        if self.ttl > self.max_ttl {
            return Err(EngineError::TtlExceedsMaxTtl {
                ttl: self.ttl,
                max_ttl: self.max_ttl,
            });
        }
        Ok(())
    }
}

pub fn validate_role_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::MissingRoleName);
    }
    if !ROLE_NAME.is_match(name) {
        return Err(EngineError::InvalidRoleName(name.to_string()));
    }
    Ok(())
}

/// Role write payload as received from the host, before validation.
#[derive(Clone, Debug, Deserialize)]
pub struct RoleRequest {
    pub key_type: String,
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_ttl", deserialize_with = "deserialize_seconds")]
    pub ttl: u64,
    #[serde(default = "default_max_ttl", deserialize_with = "deserialize_seconds")]
    pub max_ttl: u64,
}

impl RoleRequest {
    pub fn into_role(self, name: &str) -> Result<Role, EngineError> {
        validate_role_name(name)?;
        let role = Role {
            name: name.to_string(),
            key_type: self.key_type.parse()?,
            scopes: self.scopes,
            ttl: self.ttl,
            max_ttl: self.max_ttl,
        };
        role.validate()?;
        Ok(role)
    }
}

fn default_ttl() -> u64 {
    DEFAULT_ROLE_TTL_SECS
}

fn default_max_ttl() -> u64 {
    DEFAULT_ROLE_MAX_TTL_SECS
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopesInput {
    List(Vec<String>),
    Csv(String),
}

fn deserialize_scopes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = match Option::<ScopesInput>::deserialize(deserializer)? {
        None => return Ok(Vec::new()),
        Some(ScopesInput::List(list)) => list,
        Some(ScopesInput::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
    };
    Ok(raw
        .into_iter()
        .map(|scope| scope.trim().to_string())
        .filter(|scope| !scope.is_empty())
        .collect())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecondsInput {
    Number(u64),
    Text(String),
}

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match SecondsInput::deserialize(deserializer)? {
        SecondsInput::Number(secs) => Ok(secs),
        SecondsInput::Text(text) => parse_duration_secs(&text)
            .ok_or_else(|| D::Error::custom(format!("invalid duration `{text}`"))),
    }
}

/// Parses `"90"`, `"90s"`, `"15m"`, `"1h"` or `"7d"` into whole seconds.
pub fn parse_duration_secs(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, unit) = match text.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => (&text[..idx], c),
        _ => (text, 's'),
    };
    let value: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Exact record of what one issuance created at Datadog. Handed to the host as
/// opaque lease data and trusted verbatim at revocation time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedCredentialSet {
    pub key_type: KeyType,
    #[serde(
        default,
        deserialize_with = "deserialize_key_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_key_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_key: Option<String>,
}

impl IssuedCredentialSet {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            api_key: None,
            app_key: None,
        }
    }

    /// API key to delete on revocation, if the recorded key type covers one.
    pub fn revocable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|key| self.key_type.includes_api() && !key.is_empty())
    }

    pub fn revocable_app_key(&self) -> Option<&str> {
        self.app_key
            .as_deref()
            .filter(|key| self.key_type.includes_app() && !key.is_empty())
    }

    /// Parses untyped lease internal data handed back by the host.
    pub fn from_lease_data(data: Value) -> Result<Self, EngineError> {
        serde_json::from_value(data).map_err(|err| EngineError::InvalidLeaseData(err.to_string()))
    }
}

fn deserialize_key_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.is_empty()))
}

/// Lease handed to the host: the issued keys plus the TTL bounds copied from the
/// role at issuance time.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Lease {
    pub secret_type: &'static str,
    pub ttl: u64,
    pub max_ttl: u64,
    pub renewable: bool,
    #[serde(rename = "internal_data")]
    pub credentials: IssuedCredentialSet,
}

impl Lease {
    pub fn new(credentials: IssuedCredentialSet, role: &Role) -> Self {
        Self {
            secret_type: SECRET_TYPE,
            ttl: role.ttl,
            max_ttl: role.max_ttl,
            renewable: true,
            credentials,
        }
    }

    /// Caller-visible response body: only the keys that were actually minted.
    pub fn response_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        if let Some(key) = &self.credentials.api_key {
            data.insert("api_key".into(), Value::String(key.clone()));
        }
        if let Some(key) = &self.credentials.app_key {
            data.insert("app_key".into(), Value::String(key.clone()));
        }
        data
    }
}
