use crate::{
    auth::AuthHook,
    config::Config,
    constants::{
        API_ERROR_BAD_USERNAME_PASSWORD, API_ERROR_PASSWORD_SHORT,
        API_ERROR_USERNAME_ALREADY_REGISTERED, STATE_FILE_NAME,
    },
    dist_backend::DistributionBackend,
    error::RegistryError,
    models::{
        ClassifierRecord, Identity, PackageRecord, PersistedState, ReleaseKey, ReleaseRecord,
        UserRecord,
    },
};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::http::StatusCode;
use chrono::Utc;
use password_hash::{SaltString, rand_core::OsRng};
use std::{
    collections::hash_map::Entry,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, instrument, warn};

/// Persistence operations the upload flow depends on.
pub trait Repository {
    fn find_package_by_name(&self, name: &str) -> Option<&PackageRecord>;
    /// Finds a package whose PEP 503 normalized name matches `name`'s.
    fn find_package_normalized(&self, name: &str) -> Option<&PackageRecord>;
    fn upsert_package(&mut self, package: PackageRecord);
    fn find_release(&self, key: &ReleaseKey) -> Option<&ReleaseRecord>;
    fn upsert_release(&mut self, release: ReleaseRecord);
    /// Returns the classifier and whether it was created by this call.
    fn get_or_create_classifier(&mut self, name: &str) -> (ClassifierRecord, bool);
    /// Returns false when the package is unknown.
    fn add_package_classifier(&mut self, package: &str, classifier: &str) -> bool;
    fn releases_for_package(&self, package: &str) -> Vec<&ReleaseRecord>;
}

impl Repository for PersistedState {
    fn find_package_by_name(&self, name: &str) -> Option<&PackageRecord> {
        self.packages.get(name)
    }

    fn find_package_normalized(&self, name: &str) -> Option<&PackageRecord> {
        if let Some(exact) = self.packages.get(name) {
            return Some(exact);
        }
        let wanted = normalize_project_name(name);
        self.packages
            .values()
            .find(|package| normalize_project_name(&package.name) == wanted)
    }

    fn upsert_package(&mut self, package: PackageRecord) {
        self.packages.insert(package.name.clone(), package);
    }

    fn find_release(&self, key: &ReleaseKey) -> Option<&ReleaseRecord> {
        self.releases.get(&key.storage_key())
    }

    fn upsert_release(&mut self, release: ReleaseRecord) {
        self.releases.insert(release.key().storage_key(), release);
    }

    fn get_or_create_classifier(&mut self, name: &str) -> (ClassifierRecord, bool) {
        if let Some(existing) = self.classifiers.get(name) {
            return (existing.clone(), false);
        }
        let created = ClassifierRecord {
            name: name.to_string(),
            created_at: now_ms(),
        };
        self.classifiers.insert(name.to_string(), created.clone());
        (created, true)
    }

    fn add_package_classifier(&mut self, package: &str, classifier: &str) -> bool {
        let Some(record) = self.packages.get_mut(package) else {
            return false;
        };
        record.classifiers.insert(classifier.to_string());
        true
    }

    fn releases_for_package(&self, package: &str) -> Vec<&ReleaseRecord> {
        self.releases
            .values()
            .filter(|release| release.package == package)
            .collect()
    }
}

#[derive(Default)]
pub struct StoreOptions {
    pub auth_hook: Option<Arc<dyn AuthHook>>,
}

pub struct Store {
    state: RwLock<PersistedState>,
    state_file: PathBuf,
    dist_backend: DistributionBackend,
    auth_hook: Option<Arc<dyn AuthHook>>,
    password_min_length: usize,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state_file", &self.state_file)
            .field("dist_backend", &self.dist_backend)
            .field("auth_hook", &self.auth_hook.is_some())
            .finish()
    }
}

impl Store {
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: &Config) -> Result<Self, RegistryError> {
        Self::open_with_options(config, StoreOptions::default()).await
    }

    #[instrument(skip(config, options), fields(data_dir = %config.data_dir.display(), embedded_auth_hook = options.auth_hook.is_some()))]
    pub async fn open_with_options(
        config: &Config,
        options: StoreOptions,
    ) -> Result<Self, RegistryError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let dist_backend = DistributionBackend::from_config(config).await?;

        let state_file = config.data_dir.join(STATE_FILE_NAME);
        let state = load_state(&state_file).await?;
        debug!(
            users = state.users.len(),
            packages = state.packages.len(),
            releases = state.releases.len(),
            "store initialized"
        );

        Ok(Self {
            state: RwLock::new(state),
            state_file,
            dist_backend,
            auth_hook: options.auth_hook,
            password_min_length: config.password_min_length,
        })
    }

    pub fn dist_backend(&self) -> &DistributionBackend {
        &self.dist_backend
    }

    /// Adds users written to disk by another process (`--add-user`).
    async fn merge_users_from_disk(
        &self,
        state: &mut PersistedState,
    ) -> Result<usize, RegistryError> {
        let on_disk = load_state(&self.state_file).await?;
        let mut merged = 0;
        for (name, user) in on_disk.users {
            if let Entry::Vacant(slot) = state.users.entry(name) {
                slot.insert(user);
                merged += 1;
            }
        }
        if merged > 0 {
            debug!(merged, "picked up users created outside this process");
        }
        Ok(merged)
    }

    async fn persist_snapshot(&self, snapshot: &mut PersistedState) -> Result<(), RegistryError> {
        self.merge_users_from_disk(snapshot).await?;
        let tmp_file = self.state_file.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp_file, bytes).await?;
        tokio::fs::rename(&tmp_file, &self.state_file).await?;
        Ok(())
    }

    /// Starts a write transaction holding the store lock until it is dropped.
    pub async fn begin_upload(&self) -> UploadTransaction<'_> {
        let guard = self.state.write().await;
        let staged = guard.clone();
        UploadTransaction {
            store: self,
            guard,
            staged,
        }
    }

    #[instrument(skip(self, password), fields(username = name))]
    pub async fn create_user(&self, name: &str, password: &str) -> Result<(), RegistryError> {
        if password.len() < self.password_min_length {
            return Err(RegistryError::http(
                StatusCode::BAD_REQUEST,
                API_ERROR_PASSWORD_SHORT,
            ));
        }

        let mut state = self.state.write().await;
        let mut staged = state.clone();
        self.merge_users_from_disk(&mut staged).await?;
        if staged.users.contains_key(name) {
            return Err(RegistryError::http(
                StatusCode::CONFLICT,
                API_ERROR_USERNAME_ALREADY_REGISTERED,
            ));
        }

        staged.users.insert(
            name.to_string(),
            UserRecord {
                password_hash: hash_password(password)?,
                created_at: now_ms(),
            },
        );
        self.persist_snapshot(&mut staged).await?;
        *state = staged;
        debug!("created local user");
        Ok(())
    }

    /// Resolves basic-auth credentials to an identity, embedded hook first.
    pub async fn verify_credentials(
        &self,
        name: &str,
        password: &str,
    ) -> Result<Identity, RegistryError> {
        if let Some(hook) = &self.auth_hook
            && let Some(identity) = hook.authenticate(name, password).await?
        {
            debug!(username = identity.username, "credentials accepted by auth hook");
            return Ok(identity);
        }

        let known = {
            let state = self.state.read().await;
            state.users.get(name).map(|user| user.password_hash.clone())
        };
        let password_hash = match known {
            Some(hash) => hash,
            None => {
                let mut state = self.state.write().await;
                self.merge_users_from_disk(&mut state).await?;
                let Some(user) = state.users.get(name) else {
                    warn!(username = name, "unknown user");
                    return Err(RegistryError::http(
                        StatusCode::UNAUTHORIZED,
                        API_ERROR_BAD_USERNAME_PASSWORD,
                    ));
                };
                user.password_hash.clone()
            }
        };
        verify_password(&password_hash, password)?;
        Ok(Identity::new(name))
    }

    pub async fn get_package(&self, name: &str) -> Option<PackageRecord> {
        let state = self.state.read().await;
        state.find_package_by_name(name).cloned()
    }

    /// Finds a package by its PEP 503 normalized name.
    pub async fn find_package_normalized(&self, name: &str) -> Option<PackageRecord> {
        let state = self.state.read().await;
        state.find_package_normalized(name).cloned()
    }

    pub async fn all_packages(&self) -> Vec<PackageRecord> {
        let state = self.state.read().await;
        state.packages.values().cloned().collect()
    }

    pub async fn releases_for_package(&self, package: &str) -> Vec<ReleaseRecord> {
        let state = self.state.read().await;
        state
            .releases_for_package(package)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_release(&self, key: &ReleaseKey) -> Option<ReleaseRecord> {
        let state = self.state.read().await;
        state.find_release(key).cloned()
    }

    pub async fn all_classifiers(&self) -> Vec<ClassifierRecord> {
        let state = self.state.read().await;
        state.classifiers.values().cloned().collect()
    }

    pub async fn read_distribution(
        &self,
        key: &ReleaseKey,
    ) -> Result<Option<Vec<u8>>, RegistryError> {
        if self.get_release(key).await.is_none() {
            return Ok(None);
        }
        self.dist_backend.get(key).await
    }
}

/// Write transaction over the store state.
///
/// Mutations go to a staged copy. `checkpoint` persists the staged copy and
/// publishes it while keeping the lock; dropping without a checkpoint
/// discards everything staged since the last one.
pub struct UploadTransaction<'a> {
    store: &'a Store,
    guard: RwLockWriteGuard<'a, PersistedState>,
    staged: PersistedState,
}

impl UploadTransaction<'_> {
    #[instrument(skip(self))]
    pub async fn checkpoint(&mut self) -> Result<(), RegistryError> {
        self.store.persist_snapshot(&mut self.staged).await?;
        *self.guard = self.staged.clone();
        debug!("upload transaction checkpointed");
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), RegistryError> {
        self.checkpoint().await
    }
}

impl Repository for UploadTransaction<'_> {
    fn find_package_by_name(&self, name: &str) -> Option<&PackageRecord> {
        self.staged.find_package_by_name(name)
    }

    fn find_package_normalized(&self, name: &str) -> Option<&PackageRecord> {
        self.staged.find_package_normalized(name)
    }

    fn upsert_package(&mut self, package: PackageRecord) {
        self.staged.upsert_package(package);
    }

    fn find_release(&self, key: &ReleaseKey) -> Option<&ReleaseRecord> {
        self.staged.find_release(key)
    }

    fn upsert_release(&mut self, release: ReleaseRecord) {
        self.staged.upsert_release(release);
    }

    fn get_or_create_classifier(&mut self, name: &str) -> (ClassifierRecord, bool) {
        self.staged.get_or_create_classifier(name)
    }

    fn add_package_classifier(&mut self, package: &str, classifier: &str) -> bool {
        self.staged.add_package_classifier(package, classifier)
    }

    fn releases_for_package(&self, package: &str) -> Vec<&ReleaseRecord> {
        self.staged.releases_for_package(package)
    }
}

async fn load_state(state_file: &Path) -> Result<PersistedState, RegistryError> {
    if !tokio::fs::try_exists(state_file).await.unwrap_or(false) {
        return Ok(PersistedState::default());
    }
    let bytes = tokio::fs::read(state_file).await?;
    if bytes.is_empty() {
        return Ok(PersistedState::default());
    }
    serde_json::from_slice(&bytes).map_err(|err| {
        RegistryError::Storage(format!(
            "failed to parse {}: {err}",
            state_file.display()
        ))
    })
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// PEP 503 name normalization: lowercase, runs of `-_.` become `-`.
pub fn normalize_project_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

fn hash_password(password: &str) -> Result<String, RegistryError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| RegistryError::Internal)
}

fn verify_password(hash: &str, password: &str) -> Result<(), RegistryError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| RegistryError::Internal)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| RegistryError::http(StatusCode::UNAUTHORIZED, API_ERROR_BAD_USERNAME_PASSWORD))
}

#[cfg(test)]
mod tests {
    use super::{Repository, Store, normalize_project_name};
    use crate::{
        config::Config,
        models::{PackageMetadata, PackageRecord, PersistedState},
    };
    use std::collections::BTreeSet;

    fn package(name: &str, owner: &str) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            owner: owner.to_string(),
            classifiers: BTreeSet::new(),
            metadata: PackageMetadata::default(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn classifiers_are_created_once() {
        let mut state = PersistedState::default();
        let (first, created) = state.get_or_create_classifier("Topic :: A");
        assert!(created);
        let (second, created_again) = state.get_or_create_classifier("Topic :: A");
        assert!(!created_again);
        assert_eq!(first, second);
        assert_eq!(state.classifiers.len(), 1);
    }

    #[test]
    fn classifier_association_requires_known_package() {
        let mut state = PersistedState::default();
        assert!(!state.add_package_classifier("ghost", "Topic :: A"));
        state.upsert_package(package("demo", "alice"));
        assert!(state.add_package_classifier("demo", "Topic :: A"));
        assert!(state.add_package_classifier("demo", "Topic :: A"));
        let stored = state.find_package_by_name("demo").expect("package");
        assert_eq!(stored.classifiers.len(), 1);
    }

    #[test]
    fn normalizes_project_names() {
        assert_eq!(normalize_project_name("Django_Extensions"), "django-extensions");
        assert_eq!(normalize_project_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_project_name("a-_.b"), "a-b");
    }

    #[tokio::test]
    async fn dropped_transaction_discards_staged_changes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&Config::for_data_dir(dir.path()))
            .await
            .expect("store");

        {
            let mut txn = store.begin_upload().await;
            txn.upsert_package(package("kept", "alice"));
            txn.checkpoint().await.expect("checkpoint");
            txn.upsert_package(package("dropped", "alice"));
        }

        assert!(store.get_package("kept").await.is_some());
        assert!(store.get_package("dropped").await.is_none());

        let reopened = Store::open(&Config::for_data_dir(dir.path()))
            .await
            .expect("reopen");
        assert!(reopened.get_package("kept").await.is_some());
        assert!(reopened.get_package("dropped").await.is_none());
    }

    #[tokio::test]
    async fn users_created_by_another_store_survive_later_commits() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = Config::for_data_dir(dir.path());
        let server = Store::open(&cfg).await.expect("server store");
        server.create_user("alice", "alice-pw").await.expect("alice");

        let cli = Store::open(&cfg).await.expect("cli store");
        cli.create_user("carol", "carol-pw").await.expect("carol");
        drop(cli);

        let mut txn = server.begin_upload().await;
        txn.upsert_package(package("demo", "alice"));
        txn.commit().await.expect("commit");

        let identity = server
            .verify_credentials("carol", "carol-pw")
            .await
            .expect("carol visible to the running store");
        assert_eq!(identity.username, "carol");

        let reopened = Store::open(&cfg).await.expect("reopen");
        assert!(reopened.verify_credentials("carol", "carol-pw").await.is_ok());
        assert!(reopened.verify_credentials("alice", "alice-pw").await.is_ok());
        assert!(reopened.get_package("demo").await.is_some());
    }

    #[tokio::test]
    async fn login_picks_up_users_added_on_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = Config::for_data_dir(dir.path());
        let server = Store::open(&cfg).await.expect("server store");

        let cli = Store::open(&cfg).await.expect("cli store");
        cli.create_user("carol", "carol-pw").await.expect("carol");

        assert!(server.verify_credentials("carol", "carol-pw").await.is_ok());
        assert!(server.create_user("carol", "other-pw").await.is_err());
    }

    #[test]
    fn normalized_lookup_prefers_exact_match() {
        let mut state = PersistedState::default();
        state.upsert_package(package("demo", "alice"));
        assert_eq!(
            state.find_package_normalized("Demo").map(|p| p.owner.as_str()),
            Some("alice")
        );
        assert_eq!(
            state.find_package_normalized("demo").map(|p| p.name.as_str()),
            Some("demo")
        );
        assert!(state.find_package_normalized("demo2").is_none());
    }

    #[tokio::test]
    async fn users_round_trip_through_argon2() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&Config::for_data_dir(dir.path()))
            .await
            .expect("store");

        store.create_user("alice", "wonderland").await.expect("create");
        let identity = store
            .verify_credentials("alice", "wonderland")
            .await
            .expect("verify");
        assert_eq!(identity.username, "alice");

        assert!(store.verify_credentials("alice", "nope").await.is_err());
        assert!(store.verify_credentials("mallory", "x").await.is_err());
        assert!(store.create_user("alice", "again!").await.is_err());
        assert!(store.create_user("bob", "x").await.is_err());
    }
}
