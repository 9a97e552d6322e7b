use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Authenticated caller resolved from request credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub password_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageMetadata {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub maintainer: Option<String>,
    pub maintainer_email: Option<String>,
    pub home_page: Option<String>,
    pub download_url: Option<String>,
    pub license: Option<String>,
    pub keywords: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub classifiers: BTreeSet<String>,
    #[serde(default)]
    pub metadata: PackageMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub package: String,
    pub version: String,
    pub filename: String,
}

impl ReleaseKey {
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            filename: filename.into(),
        }
    }

    /// Key used in the persisted release map.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.package, self.version, self.filename)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub package: String,
    pub version: String,
    pub filename: String,
    pub filetype: String,
    pub pyversion: Option<String>,
    pub comment: Option<String>,
    pub md5_digest: Option<String>,
    pub sha256_digest: String,
    pub size: u64,
    pub uploaded_by: String,
    pub uploaded_at: i64,
}

impl ReleaseRecord {
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(&self.package, &self.version, &self.filename)
    }

    /// Human label used in conflict messages, e.g. `demo-1.0`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.package, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierRecord {
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PersistedState {
    pub users: HashMap<String, UserRecord>,
    pub packages: BTreeMap<String, PackageRecord>,
    pub releases: BTreeMap<String, ReleaseRecord>,
    pub classifiers: BTreeMap<String, ClassifierRecord>,
}
