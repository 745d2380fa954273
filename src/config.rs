//! Configuration loading and types.
//!
//! Settings come from two places: the process-wide configuration file
//! (deserialized into [`Config`]) and per-instance overrides handed to
//! [`S3Storage`](crate::storage::s3::S3Storage) at construction.  Both are
//! [`SettingsLayer`]s.  [`Settings::resolve`] merges them field by field:
//! instance override, then process-wide value, then built-in default.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, StorageError};

/// Scheme served when no endpoints are configured.
pub const DEFAULT_SCHEME: &str = "s3";

/// Every recognised setting name, short form first, then the long form
/// accepted as an alias.
const SETTING_NAMES: &[(&str, &str)] = &[
    ("region", "aws_region"),
    ("access_key_id", "aws_access_key_id"),
    ("secret_access_key", "aws_secret_access_key"),
    ("session_token", "aws_session_token"),
    ("addressing_style", "aws_s3_addressing_style"),
    ("endpoints", "aws_s3_endpoints"),
    ("key_prefix", "aws_s3_key_prefix"),
    ("max_age_seconds", "aws_s3_max_age_seconds"),
    ("reduced_redundancy", "aws_s3_reduced_redundancy"),
    ("content_disposition", "aws_s3_content_disposition"),
    ("content_language", "aws_s3_content_language"),
    ("metadata", "aws_s3_metadata"),
    ("encrypt_key", "aws_s3_encrypt_key"),
    ("kms_encryption_key_id", "aws_s3_kms_encryption_key_id"),
    ("gzip", "aws_s3_gzip"),
    ("signature_version", "aws_s3_signature_version"),
    ("file_overwrite", "aws_s3_file_overwrite"),
    ("use_threads", "aws_s3_use_threads"),
    ("max_pool_connections", "aws_s3_max_pool_connections"),
    ("connect_timeout", "aws_s3_connect_timeout"),
];

/// Top-level process-wide configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Process-wide storage settings.
    #[serde(default)]
    pub storage: SettingsLayer,

    /// Return timezone-aware timestamps from the `get_*_time` family.
    #[serde(default = "default_true")]
    pub use_tz: bool,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: SettingsLayer::default(),
            use_tz: true,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Data and presigning endpoint for one scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoints {
    /// Base URL for data calls; `None` means the provider default.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Base URL used when signing URLs; defaults to `endpoint_url`.
    #[serde(default)]
    pub endpoint_url_presigning: Option<String>,
}

impl Endpoints {
    /// Endpoints with a data URL and no distinct presigning URL.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.into()),
            endpoint_url_presigning: None,
        }
    }

    /// Endpoints with distinct data and presigning URLs.
    pub fn with_presigning(
        endpoint_url: impl Into<String>,
        endpoint_url_presigning: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_url: Some(endpoint_url.into()),
            endpoint_url_presigning: Some(endpoint_url_presigning.into()),
        }
    }

    /// The data URL, treating an empty string as unset.
    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_deref().filter(|url| !url.is_empty())
    }

    /// The presigning URL, but only when it differs from the data URL.
    pub fn presigning_url(&self) -> Option<&str> {
        self.endpoint_url_presigning
            .as_deref()
            .filter(|url| !url.is_empty())
            .filter(|url| Some(*url) != self.endpoint_url())
    }
}

/// A setting that is either a fixed string or computed from the file name.
#[derive(Clone)]
pub enum SettingValue {
    /// The same value for every file.
    Literal(String),
    /// A value derived from the storage name at the point of use.
    Computed(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl SettingValue {
    /// Wrap a name → value function.
    pub fn computed(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        SettingValue::Computed(Arc::new(f))
    }

    /// Produce the value for `name`.
    pub fn resolve(&self, name: &str) -> String {
        match self {
            SettingValue::Literal(value) => value.clone(),
            SettingValue::Computed(f) => f(name),
        }
    }
}

impl Default for SettingValue {
    fn default() -> Self {
        SettingValue::Literal(String::new())
    }
}

impl fmt::Debug for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            SettingValue::Computed(_) => f.write_str("Computed(<fn>)"),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Literal(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Literal(value)
    }
}

impl<'de> Deserialize<'de> for SettingValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SettingValue::Literal)
    }
}

/// Server-side encryption policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Encryption {
    /// No server-side encryption header.
    #[default]
    Off,
    /// The default `AES256` algorithm.
    Aes256,
    /// A named algorithm such as `aws:kms`.
    Algorithm(String),
}

impl Encryption {
    /// Algorithm name to send, if any.
    pub fn algorithm(&self) -> Option<&str> {
        match self {
            Encryption::Off => None,
            Encryption::Aes256 => Some("AES256"),
            Encryption::Algorithm(name) => Some(name),
        }
    }
}

impl<'de> Deserialize<'de> for Encryption {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Name(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Flag(false) => Encryption::Off,
            Repr::Flag(true) => Encryption::Aes256,
            Repr::Name(name) if name.is_empty() => Encryption::Off,
            Repr::Name(name) => Encryption::Algorithm(name),
        })
    }
}

/// Bucket addressing style used by the S3 client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingStyle {
    /// Let the client decide.
    #[default]
    Auto,
    /// `bucket.host/key`.
    Virtual,
    /// `host/bucket/key`.
    Path,
}

/// A partial set of storage settings.
///
/// Unknown keys are rejected when a layer is deserialized, so a typo in
/// an override fails at construction rather than being ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsLayer {
    #[serde(alias = "aws_region")]
    pub region: Option<String>,
    #[serde(alias = "aws_access_key_id")]
    pub access_key_id: Option<String>,
    #[serde(alias = "aws_secret_access_key")]
    pub secret_access_key: Option<String>,
    #[serde(alias = "aws_session_token")]
    pub session_token: Option<String>,
    #[serde(alias = "aws_s3_addressing_style")]
    pub addressing_style: Option<AddressingStyle>,
    #[serde(alias = "aws_s3_endpoints")]
    pub endpoints: Option<BTreeMap<String, Endpoints>>,
    #[serde(alias = "aws_s3_key_prefix")]
    pub key_prefix: Option<String>,
    #[serde(alias = "aws_s3_max_age_seconds")]
    pub max_age_seconds: Option<u64>,
    #[serde(alias = "aws_s3_reduced_redundancy")]
    pub reduced_redundancy: Option<bool>,
    #[serde(alias = "aws_s3_content_disposition")]
    pub content_disposition: Option<SettingValue>,
    #[serde(alias = "aws_s3_content_language")]
    pub content_language: Option<SettingValue>,
    #[serde(alias = "aws_s3_metadata")]
    pub metadata: Option<BTreeMap<String, SettingValue>>,
    #[serde(alias = "aws_s3_encrypt_key")]
    pub encrypt_key: Option<Encryption>,
    #[serde(alias = "aws_s3_kms_encryption_key_id")]
    pub kms_encryption_key_id: Option<String>,
    #[serde(alias = "aws_s3_gzip")]
    pub gzip: Option<bool>,
    #[serde(alias = "aws_s3_signature_version")]
    pub signature_version: Option<String>,
    #[serde(alias = "aws_s3_file_overwrite")]
    pub file_overwrite: Option<bool>,
    #[serde(alias = "aws_s3_use_threads")]
    pub use_threads: Option<bool>,
    #[serde(alias = "aws_s3_max_pool_connections")]
    pub max_pool_connections: Option<u32>,
    #[serde(alias = "aws_s3_connect_timeout")]
    pub connect_timeout: Option<u64>,
}

impl SettingsLayer {
    /// Build a layer from loosely typed key/value pairs.
    ///
    /// Keys are case-insensitive and may use either the short or the
    /// `aws_`-prefixed name.  Any unrecognised key is a configuration error.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, serde_yaml::Value)>,
        K: AsRef<str>,
    {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in pairs {
            let key = key.as_ref().to_ascii_lowercase();
            if !Self::is_setting_name(&key) {
                return Err(StorageError::Config(format!(
                    "Unknown S3Storage parameters: {key}"
                )));
            }
            mapping.insert(serde_yaml::Value::String(key), value);
        }
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
            .map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Whether `name` (case-insensitive, short or long form) is a storage setting.
    pub fn is_setting_name(name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        SETTING_NAMES
            .iter()
            .any(|(short, long)| *short == name || *long == name)
    }

    /// Field-wise merge: values set on `self` win over `lower`.
    pub fn merged_over(&self, lower: &SettingsLayer) -> SettingsLayer {
        SettingsLayer {
            region: self.region.clone().or_else(|| lower.region.clone()),
            access_key_id: self
                .access_key_id
                .clone()
                .or_else(|| lower.access_key_id.clone()),
            secret_access_key: self
                .secret_access_key
                .clone()
                .or_else(|| lower.secret_access_key.clone()),
            session_token: self
                .session_token
                .clone()
                .or_else(|| lower.session_token.clone()),
            addressing_style: self.addressing_style.or(lower.addressing_style),
            endpoints: self.endpoints.clone().or_else(|| lower.endpoints.clone()),
            key_prefix: self.key_prefix.clone().or_else(|| lower.key_prefix.clone()),
            max_age_seconds: self.max_age_seconds.or(lower.max_age_seconds),
            reduced_redundancy: self.reduced_redundancy.or(lower.reduced_redundancy),
            content_disposition: self
                .content_disposition
                .clone()
                .or_else(|| lower.content_disposition.clone()),
            content_language: self
                .content_language
                .clone()
                .or_else(|| lower.content_language.clone()),
            metadata: self.metadata.clone().or_else(|| lower.metadata.clone()),
            encrypt_key: self.encrypt_key.clone().or_else(|| lower.encrypt_key.clone()),
            kms_encryption_key_id: self
                .kms_encryption_key_id
                .clone()
                .or_else(|| lower.kms_encryption_key_id.clone()),
            gzip: self.gzip.or(lower.gzip),
            signature_version: self
                .signature_version
                .clone()
                .or_else(|| lower.signature_version.clone()),
            file_overwrite: self.file_overwrite.or(lower.file_overwrite),
            use_threads: self.use_threads.or(lower.use_threads),
            max_pool_connections: self.max_pool_connections.or(lower.max_pool_connections),
            connect_timeout: self.connect_timeout.or(lower.connect_timeout),
        }
    }
}

/// Fully resolved, immutable storage settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub addressing_style: AddressingStyle,
    /// Scheme → endpoints.  Scheme keys are lower-case.
    pub endpoints: BTreeMap<String, Endpoints>,
    pub key_prefix: String,
    pub max_age_seconds: u64,
    pub reduced_redundancy: bool,
    pub content_disposition: SettingValue,
    pub content_language: SettingValue,
    pub metadata: BTreeMap<String, SettingValue>,
    pub encrypt_key: Encryption,
    pub kms_encryption_key_id: String,
    pub gzip: bool,
    pub signature_version: String,
    pub file_overwrite: bool,
    pub use_threads: bool,
    pub max_pool_connections: u32,
    pub connect_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            addressing_style: AddressingStyle::Auto,
            endpoints: default_endpoints(),
            key_prefix: String::new(),
            max_age_seconds: default_max_age_seconds(),
            reduced_redundancy: false,
            content_disposition: SettingValue::default(),
            content_language: SettingValue::default(),
            metadata: BTreeMap::new(),
            encrypt_key: Encryption::Off,
            kms_encryption_key_id: String::new(),
            gzip: true,
            signature_version: default_signature_version(),
            file_overwrite: false,
            use_threads: true,
            max_pool_connections: default_max_pool_connections(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Settings {
    /// Merge `instance` over `global` over the defaults and validate.
    pub fn resolve(instance: &SettingsLayer, global: &SettingsLayer) -> Result<Self> {
        let layer = instance.merged_over(global);
        let defaults = Settings::default();

        let signature_version = layer
            .signature_version
            .unwrap_or(defaults.signature_version);
        if !matches!(signature_version.as_str(), "s3v4" | "v4") {
            return Err(StorageError::Config(format!(
                "unsupported signature version {signature_version:?}; only s3v4 is available"
            )));
        }

        let max_pool_connections = layer
            .max_pool_connections
            .unwrap_or(defaults.max_pool_connections);
        if max_pool_connections == 0 {
            return Err(StorageError::Config(
                "max_pool_connections must be at least 1".to_string(),
            ));
        }

        let endpoints: BTreeMap<String, Endpoints> = layer
            .endpoints
            .unwrap_or(defaults.endpoints)
            .into_iter()
            .map(|(scheme, endpoints)| (scheme.to_ascii_lowercase(), endpoints))
            .collect();
        if let Some(scheme) = endpoints.keys().find(|s| s.is_empty()) {
            return Err(StorageError::Config(format!(
                "endpoint scheme must not be empty: {scheme:?}"
            )));
        }

        Ok(Settings {
            region: layer.region.unwrap_or(defaults.region),
            access_key_id: layer.access_key_id.unwrap_or_default(),
            secret_access_key: layer.secret_access_key.unwrap_or_default(),
            session_token: layer.session_token.unwrap_or_default(),
            addressing_style: layer.addressing_style.unwrap_or_default(),
            endpoints,
            key_prefix: layer.key_prefix.unwrap_or_default(),
            max_age_seconds: layer.max_age_seconds.unwrap_or(defaults.max_age_seconds),
            reduced_redundancy: layer.reduced_redundancy.unwrap_or(false),
            content_disposition: layer.content_disposition.unwrap_or_default(),
            content_language: layer.content_language.unwrap_or_default(),
            metadata: layer.metadata.unwrap_or_default(),
            encrypt_key: layer.encrypt_key.unwrap_or_default(),
            kms_encryption_key_id: layer.kms_encryption_key_id.unwrap_or_default(),
            gzip: layer.gzip.unwrap_or(defaults.gzip),
            signature_version,
            file_overwrite: layer.file_overwrite.unwrap_or(false),
            use_threads: layer.use_threads.unwrap_or(defaults.use_threads),
            max_pool_connections,
            connect_timeout: layer.connect_timeout.unwrap_or(defaults.connect_timeout),
        })
    }

    /// Expiry for signed URLs.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    /// `Cache-Control` header written on every upload.
    pub fn cache_control(&self) -> String {
        format!("private,max-age={}", self.max_age_seconds)
    }

    /// Connection timeout for remote clients.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_endpoints() -> BTreeMap<String, Endpoints> {
    BTreeMap::from([(DEFAULT_SCHEME.to_string(), Endpoints::default())])
}

fn default_max_age_seconds() -> u64 {
    60 * 60
}

fn default_signature_version() -> String {
    "s3v4".to_string()
}

fn default_max_pool_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

// -- Tests -------------------------------------------------------------------
