use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use config::{Config as SettingsLoader, Environment};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

const DEFAULT_BIND: &str = "127.0.0.1:8000";
const DEFAULT_DATA_DIR: &str = ".rustpypi-data";
const DEFAULT_MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistStorageBackend {
    Local,
    S3,
}

impl DistStorageBackend {
    fn from_str(value: &str) -> Self {
        if value.eq_ignore_ascii_case("s3") {
            Self::S3
        } else {
            Self::Local
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3DistStorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub prefix: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistStorageConfig {
    pub backend: DistStorageBackend,
    pub s3: Option<S3DistStorageConfig>,
}

impl Default for DistStorageConfig {
    fn default() -> Self {
        Self {
            backend: DistStorageBackend::Local,
            s3: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadPolicy {
    /// Re-uploading an existing (package, version, filename) replaces it.
    pub allow_version_overwrite: bool,
    /// Package and release changes commit together or not at all.
    pub atomic: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub url_prefix: String,
    pub max_body_size: usize,
    pub password_min_length: usize,
    pub log_level: String,
    pub upload: UploadPolicy,
    pub dist_storage: DistStorageConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawEnvConfig {
    config: Option<String>,
    config_base64: Option<String>,
    bind: Option<String>,
    data_dir: Option<String>,
    url_prefix: Option<String>,
    max_body_size: Option<String>,
    password_min: Option<String>,
    log_level: Option<String>,
    allow_version_overwrite: Option<String>,
    atomic_uploads: Option<String>,
    dist_backend: Option<String>,
    s3_bucket: Option<String>,
    s3_region: Option<String>,
    s3_endpoint: Option<String>,
    s3_access_key_id: Option<String>,
    s3_secret_access_key: Option<String>,
    s3_prefix: Option<String>,
    s3_force_path_style: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_cfg = load_rustpypi_env()?;
        let mut cfg = Self::from_env_config_source(&env_cfg)?.unwrap_or_else(Self::defaults);
        cfg.apply_env_overrides(&env_cfg);
        cfg.apply_port_override(load_port()?);
        Ok(cfg)
    }

    /// Like [`Config::from_env`], but the YAML file at `config_path` replaces
    /// `RUSTPYPI_CONFIG`/`RUSTPYPI_CONFIG_BASE64` as the base layer.
    pub fn from_env_with_config_file(config_path: PathBuf) -> Result<Self, String> {
        let env_cfg = load_rustpypi_env()?;
        let mut cfg = Self::from_yaml_file(config_path)?;
        cfg.apply_env_overrides(&env_cfg);
        cfg.apply_port_override(load_port()?);
        Ok(cfg)
    }

    pub fn defaults() -> Self {
        let bind = DEFAULT_BIND
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8000)));

        Self {
            bind,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            url_prefix: "/".to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            password_min_length: 3,
            log_level: "info".to_string(),
            upload: UploadPolicy::default(),
            dist_storage: DistStorageConfig::default(),
        }
    }

    /// Defaults rooted at `data_dir`, convenient for embedding and tests.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::defaults()
        }
    }

    fn from_env_config_source(env_cfg: &RawEnvConfig) -> Result<Option<Self>, String> {
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };

        match (non_blank(&env_cfg.config), non_blank(&env_cfg.config_base64)) {
            (Some(_), Some(_)) => Err(
                "RUSTPYPI_CONFIG and RUSTPYPI_CONFIG_BASE64 are both set; use only one"
                    .to_string(),
            ),
            (Some(path), None) => Self::from_yaml_file(PathBuf::from(&path))
                .map(Some)
                .map_err(|err| format!("failed to load RUSTPYPI_CONFIG={path}: {err}")),
            (None, Some(encoded)) => decode_base64_yaml(&encoded)
                .and_then(|yaml| Self::from_yaml_str("RUSTPYPI_CONFIG_BASE64", &yaml))
                .map(Some)
                .map_err(|err| format!("failed to load RUSTPYPI_CONFIG_BASE64: {err}")),
            (None, None) => Ok(None),
        }
    }

    fn apply_env_overrides(&mut self, env_cfg: &RawEnvConfig) {
        if let Some(bind) = parse_env_value::<SocketAddr>(env_cfg.bind.as_deref()) {
            self.bind = bind;
        }
        if let Some(raw_data_dir) = env_cfg.data_dir.as_deref()
            && !raw_data_dir.trim().is_empty()
        {
            self.data_dir = PathBuf::from(raw_data_dir);
        }
        if let Some(value) = env_cfg.url_prefix.as_deref() {
            self.url_prefix = normalize_url_prefix(value);
        }
        if let Some(value) = env_cfg.max_body_size.as_deref()
            && let Some(parsed) = parse_body_size(value)
        {
            self.max_body_size = parsed;
        }
        if let Some(parsed) = parse_env_value::<usize>(env_cfg.password_min.as_deref()) {
            self.password_min_length = parsed;
        }
        if let Some(value) = env_cfg.log_level.as_deref()
            && !value.trim().is_empty()
        {
            self.log_level = value.to_string();
        }
        if let Some(parsed) = parse_env_bool(env_cfg.allow_version_overwrite.as_deref()) {
            self.upload.allow_version_overwrite = parsed;
        }
        if let Some(parsed) = parse_env_bool(env_cfg.atomic_uploads.as_deref()) {
            self.upload.atomic = parsed;
        }

        self.apply_storage_env_overrides(env_cfg);
    }

    fn apply_port_override(&mut self, port_value: Option<String>) {
        // PaaS compatibility: an injected PORT wins and binds publicly.
        if let Some(port) = parse_env_value::<u16>(port_value.as_deref()) {
            self.bind = SocketAddr::from(([0, 0, 0, 0], port));
        }
    }

    fn apply_storage_env_overrides(&mut self, env_cfg: &RawEnvConfig) {
        if let Some(value) = env_cfg.dist_backend.as_deref() {
            self.dist_storage.backend = DistStorageBackend::from_str(value);
        }

        if self.dist_storage.backend == DistStorageBackend::Local {
            self.dist_storage.s3 = None;
            return;
        }

        let mut s3 = self
            .dist_storage
            .s3
            .clone()
            .unwrap_or_else(default_s3_storage_config);

        if let Some(value) = env_cfg.s3_bucket.as_deref()
            && !value.is_empty()
        {
            s3.bucket = value.to_string();
        }
        if let Some(value) = env_cfg.s3_region.as_deref()
            && !value.is_empty()
        {
            s3.region = value.to_string();
        }
        if let Some(value) = env_cfg.s3_endpoint.as_deref() {
            s3.endpoint = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.s3_access_key_id.as_deref() {
            s3.access_key_id = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.s3_secret_access_key.as_deref() {
            s3.secret_access_key = empty_string_to_none(value.to_string());
        }
        if let Some(value) = env_cfg.s3_prefix.as_deref() {
            s3.prefix = value.to_string();
        }
        if let Some(parsed) = parse_env_bool(env_cfg.s3_force_path_style.as_deref()) {
            s3.force_path_style = parsed;
        }

        self.dist_storage.s3 = Some(s3);
    }

    pub fn from_yaml_file(path: PathBuf) -> Result<Self, String> {
        let parsed = load_yaml_config(&path)?;
        Self::from_yaml_config(parsed)
    }

    fn from_yaml_str(source: &str, text: &str) -> Result<Self, String> {
        let parsed = serde_yaml::from_str::<YamlConfig>(text)
            .map_err(|err| format!("failed to parse {source}: {err}"))?;
        Self::from_yaml_config(parsed)
    }

    fn from_yaml_config(parsed: YamlConfig) -> Result<Self, String> {
        let bind = parse_bind(parsed.listen.as_ref())?;
        let data_dir = parse_data_dir(parsed.storage.as_ref());
        let max_body_size = match parsed.max_body_size.as_deref() {
            Some(raw) => parse_body_size(raw)
                .ok_or_else(|| format!("invalid max_body_size '{raw}'"))?,
            None => DEFAULT_MAX_BODY_SIZE,
        };
        let url_prefix = normalize_url_prefix(parsed.url_prefix.as_deref().unwrap_or("/"));
        let log_level = parsed
            .log
            .and_then(|log| log.level)
            .unwrap_or_else(|| "info".to_string());
        let upload = parsed
            .upload
            .map(|upload| UploadPolicy {
                allow_version_overwrite: upload.allow_version_overwrite.unwrap_or(false),
                atomic: upload.atomic.unwrap_or(false),
            })
            .unwrap_or_default();
        let password_min_length = parsed
            .auth
            .and_then(|auth| auth.password_min_length)
            .unwrap_or(3);
        let dist_storage = parsed
            .store
            .map(parse_storage_config)
            .unwrap_or_default();

        Ok(Self {
            bind,
            data_dir,
            url_prefix,
            max_body_size,
            password_min_length,
            log_level,
            upload,
            dist_storage,
        })
    }
}

fn load_yaml_config(path: &Path) -> Result<YamlConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    serde_yaml::from_str::<YamlConfig>(&text)
        .map_err(|err| format!("failed to parse {}: {err}", path.display()))
}

/// Decodes a base64 YAML document; embedded line breaks are ignored.
fn decode_base64_yaml(encoded: &str) -> Result<String, String> {
    let compact: String = encoded.split_ascii_whitespace().collect();
    let bytes = B64
        .decode(compact)
        .map_err(|err| format!("invalid base64: {err}"))?;
    String::from_utf8(bytes).map_err(|err| format!("decoded bytes are not UTF-8 ({err})"))
}

fn load_rustpypi_env() -> Result<RawEnvConfig, String> {
    // keys arrive lowercased with the prefix stripped, e.g. `s3_bucket`
    SettingsLoader::builder()
        .add_source(Environment::with_prefix("RUSTPYPI").try_parsing(false))
        .build()
        .and_then(SettingsLoader::try_deserialize)
        .map_err(|err| format!("failed to load RUSTPYPI_* environment: {err}"))
}

fn load_port() -> Result<Option<String>, String> {
    let settings = SettingsLoader::builder()
        .add_source(Environment::default().try_parsing(false))
        .build()
        .map_err(|err| format!("failed to load process environment: {err}"))?;
    Ok(settings.get_string("port").ok())
}

fn parse_env_value<T>(raw: Option<&str>) -> Option<T>
where
    T: std::str::FromStr,
{
    raw.and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_env_bool(raw: Option<&str>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_s3_storage_config() -> S3DistStorageConfig {
    S3DistStorageConfig {
        bucket: String::new(),
        region: "us-east-1".to_string(),
        endpoint: None,
        access_key_id: None,
        secret_access_key: None,
        prefix: String::new(),
        force_path_style: true,
    }
}

fn empty_string_to_none(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn parse_storage_config(storage: YamlStore) -> DistStorageConfig {
    let backend = storage
        .backend
        .as_deref()
        .map(DistStorageBackend::from_str)
        .unwrap_or(DistStorageBackend::Local);

    match backend {
        DistStorageBackend::Local => DistStorageConfig::default(),
        DistStorageBackend::S3 => {
            let s3 = storage.s3.unwrap_or_default();
            DistStorageConfig {
                backend,
                s3: Some(S3DistStorageConfig {
                    bucket: s3.bucket.unwrap_or_default(),
                    region: s3.region.unwrap_or_else(|| "us-east-1".to_string()),
                    endpoint: s3.endpoint,
                    access_key_id: s3.access_key_id,
                    secret_access_key: s3.secret_access_key,
                    prefix: s3.prefix.unwrap_or_default(),
                    force_path_style: s3.force_path_style.unwrap_or(true),
                }),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct YamlConfig {
    listen: Option<StringOrVec>,
    storage: Option<String>,
    store: Option<YamlStore>,
    upload: Option<YamlUpload>,
    auth: Option<YamlAuth>,
    max_body_size: Option<String>,
    url_prefix: Option<String>,
    log: Option<YamlLog>,
}

#[derive(Debug, Deserialize)]
struct YamlUpload {
    #[serde(rename = "allowVersionOverwrite", alias = "allow_version_overwrite")]
    allow_version_overwrite: Option<bool>,
    atomic: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct YamlAuth {
    #[serde(rename = "passwordMinLength", alias = "password_min_length")]
    password_min_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct YamlLog {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlStore {
    backend: Option<String>,
    s3: Option<YamlStoreS3>,
}

#[derive(Debug, Deserialize, Default)]
struct YamlStoreS3 {
    bucket: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    #[serde(rename = "accessKeyId")]
    access_key_id: Option<String>,
    #[serde(rename = "secretAccessKey")]
    secret_access_key: Option<String>,
    prefix: Option<String>,
    #[serde(rename = "forcePathStyle")]
    force_path_style: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

fn parse_bind(listen: Option<&StringOrVec>) -> Result<SocketAddr, String> {
    // only the first address is served
    let addr = match listen {
        Some(StringOrVec::One(addr)) => addr.as_str(),
        Some(StringOrVec::Many(addrs)) => addrs.first().map_or(DEFAULT_BIND, String::as_str),
        None => DEFAULT_BIND,
    };
    addr.parse()
        .map_err(|err| format!("invalid listen address '{addr}': {err}"))
}

fn parse_data_dir(storage: Option<&String>) -> PathBuf {
    storage
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

fn parse_body_size(raw: &str) -> Option<usize> {
    let value = raw.trim().to_ascii_lowercase();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(digits_end);
    let multiplier: usize = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return None,
    };
    number.parse::<usize>().ok()?.checked_mul(multiplier)
}

fn normalize_url_prefix(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let with_leading = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    with_leading.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::{Config, normalize_url_prefix, parse_body_size};
    use std::io::Write;

    #[test]
    fn defaults_reject_overwrite() {
        let cfg = Config::defaults();
        assert!(!cfg.upload.allow_version_overwrite);
        assert!(!cfg.upload.atomic);
        assert_eq!(cfg.url_prefix, "/");
    }

    #[test]
    fn rejects_invalid_body_size() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_body_size: lots").expect("write");
        let err = Config::from_yaml_file(file.path().to_path_buf()).expect_err("invalid");
        assert!(err.contains("max_body_size"));
    }

    #[test]
    fn body_sizes_and_prefixes_normalize() {
        assert_eq!(parse_body_size("512kb"), Some(512 * 1024));
        assert_eq!(parse_body_size("2 GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_body_size("mb"), None);
        assert_eq!(normalize_url_prefix(""), "/");
        assert_eq!(normalize_url_prefix("/simple-index/"), "/simple-index");
    }
}
