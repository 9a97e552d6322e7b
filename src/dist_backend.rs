use crate::{
    config::{Config, DistStorageBackend},
    constants::DISTRIBUTIONS_DIR_NAME,
    error::RegistryError,
    models::ReleaseKey,
};
#[cfg(feature = "s3")]
use crate::config::S3DistStorageConfig;
#[cfg(feature = "s3")]
use tracing::warn;
use std::path::PathBuf;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Where distribution files live. Every operation is keyed by
/// package/version/filename, so a release maps to exactly one object.
#[derive(Debug, Clone)]
pub enum DistributionBackend {
    Local(LocalDistributionBackend),
    #[cfg(feature = "s3")]
    S3(S3DistributionBackend),
}

impl DistributionBackend {
    #[instrument(skip(config), fields(backend = ?config.dist_storage.backend, data_dir = %config.data_dir.display()))]
    pub async fn from_config(config: &Config) -> Result<Self, RegistryError> {
        match config.dist_storage.backend {
            DistStorageBackend::Local => {
                let root = config.data_dir.join(DISTRIBUTIONS_DIR_NAME);
                tokio::fs::create_dir_all(&root).await?;
                debug!(root = %root.display(), "initialized local distribution backend");
                Ok(Self::Local(LocalDistributionBackend::new(root)))
            }
            DistStorageBackend::S3 => {
                #[cfg(feature = "s3")]
                {
                    let Some(s3) = config.dist_storage.s3.as_ref() else {
                        return Err(RegistryError::Storage(
                            "s3 distribution backend configured without s3 section".to_string(),
                        ));
                    };
                    Ok(Self::S3(S3DistributionBackend::new(s3).await?))
                }
                #[cfg(not(feature = "s3"))]
                {
                    Err(RegistryError::Storage(
                        "s3 distribution backend is not compiled in (enable `s3` feature)"
                            .to_string(),
                    ))
                }
            }
        }
    }

    /// Writes `content` at the key, replacing any previous bytes in one step.
    pub async fn replace(&self, key: &ReleaseKey, content: &[u8]) -> Result<(), RegistryError> {
        match self {
            Self::Local(backend) => backend.replace(key, content).await,
            #[cfg(feature = "s3")]
            Self::S3(backend) => backend.replace(key, content).await,
        }
    }

    pub async fn get(&self, key: &ReleaseKey) -> Result<Option<Vec<u8>>, RegistryError> {
        match self {
            Self::Local(backend) => backend.get(key).await,
            #[cfg(feature = "s3")]
            Self::S3(backend) => backend.get(key).await,
        }
    }

    pub async fn exists(&self, key: &ReleaseKey) -> Result<bool, RegistryError> {
        match self {
            Self::Local(backend) => backend.exists(key).await,
            #[cfg(feature = "s3")]
            Self::S3(backend) => backend.exists(&backend.key(key)).await,
        }
    }

    pub async fn delete(&self, key: &ReleaseKey) -> Result<bool, RegistryError> {
        match self {
            Self::Local(backend) => backend.delete(key).await,
            #[cfg(feature = "s3")]
            Self::S3(backend) => backend.delete(key).await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalDistributionBackend {
    root: PathBuf,
}

impl LocalDistributionBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, key: &ReleaseKey) -> PathBuf {
        self.root
            .join(&key.package)
            .join(&key.version)
            .join(&key.filename)
    }

    #[instrument(skip(self, content), fields(package = %key.package, version = %key.version, filename = %key.filename, bytes = content.len()))]
    pub async fn replace(&self, key: &ReleaseKey, content: &[u8]) -> Result<(), RegistryError> {
        let path = self.path_for(key);
        let Some(parent) = path.parent() else {
            return Err(RegistryError::Storage(format!(
                "distribution path {} has no parent",
                path.display()
            )));
        };
        tokio::fs::create_dir_all(parent).await?;

        // rename within one directory replaces the target atomically
        let tmp_path = parent.join(format!(".{}.{}.tmp", key.filename, Uuid::new_v4()));
        if let Err(err) = tokio::fs::write(&tmp_path, content).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        debug!(path = %path.display(), "wrote distribution to local storage");
        Ok(())
    }

    #[instrument(skip(self), fields(package = %key.package, version = %key.version, filename = %key.filename))]
    pub async fn get(&self, key: &ReleaseKey) -> Result<Option<Vec<u8>>, RegistryError> {
        let path = self.path_for(key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "local distribution missing");
            return Ok(None);
        }
        Ok(Some(tokio::fs::read(path).await?))
    }

    pub async fn exists(&self, key: &ReleaseKey) -> Result<bool, RegistryError> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    #[instrument(skip(self), fields(package = %key.package, version = %key.version, filename = %key.filename))]
    pub async fn delete(&self, key: &ReleaseKey) -> Result<bool, RegistryError> {
        let path = self.path_for(key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        debug!("deleted local distribution");
        Ok(true)
    }
}

#[cfg(feature = "s3")]
#[derive(Debug, Clone)]
pub struct S3DistributionBackend {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

#[cfg(feature = "s3")]
impl S3DistributionBackend {
    #[instrument(skip(cfg), fields(bucket = cfg.bucket, region = cfg.region, endpoint = cfg.endpoint.as_deref().unwrap_or("<aws-default>")))]
    pub async fn new(cfg: &S3DistStorageConfig) -> Result<Self, RegistryError> {
        if cfg.bucket.trim().is_empty() {
            return Err(RegistryError::Storage(
                "s3.bucket is required for s3 distribution backend".to_string(),
            ));
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (cfg.access_key_id.clone(), cfg.secret_access_key.clone())
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "rustpypi-static",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = cfg.endpoint.clone() {
            builder = builder.endpoint_url(endpoint);
        }
        if cfg.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
            prefix: normalize_prefix(&cfg.prefix),
        })
    }

    fn key(&self, key: &ReleaseKey) -> String {
        format!("{}{}", self.prefix, key.storage_key())
    }

    async fn exists(&self, object_key: &str) -> Result<bool, RegistryError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                warn!("s3 head_object failed");
                Err(RegistryError::Storage(err.to_string()))
            }
        }
    }

    // PutObject is a whole-object replace on S3.
    #[instrument(skip(self, content), fields(object = %key.storage_key(), bytes = content.len()))]
    pub async fn replace(&self, key: &ReleaseKey, content: &[u8]) -> Result<(), RegistryError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .body(aws_sdk_s3::primitives::ByteStream::from(content.to_vec()))
            .send()
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        debug!("uploaded distribution to s3");
        Ok(())
    }

    #[instrument(skip(self), fields(object = %key.storage_key()))]
    pub async fn get(&self, key: &ReleaseKey) -> Result<Option<Vec<u8>>, RegistryError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => {
                warn!("s3 get_object failed");
                return Err(RegistryError::Storage(err.to_string()));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))?
            .into_bytes();
        debug!(bytes = bytes.len(), "downloaded distribution from s3");
        Ok(Some(bytes.to_vec()))
    }

    #[instrument(skip(self), fields(object = %key.storage_key()))]
    pub async fn delete(&self, key: &ReleaseKey) -> Result<bool, RegistryError> {
        let object_key = self.key(key);
        if !self.exists(&object_key).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|err| RegistryError::Storage(err.to_string()))?;
        debug!("deleted distribution from s3");
        Ok(true)
    }
}

#[cfg(feature = "s3")]
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(feature = "s3")]
fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    err.raw_response()
        .map(|response| response.status().as_u16() == 404)
        .unwrap_or(false)
}
