//! The distutils `register`/`upload` handler.

use crate::{
    config::UploadPolicy,
    constants::{API_ERROR_PACKAGE_OWNED_BY_OTHER, already_exists_message},
    error::RegistryError,
    forms::{PackageForm, ReleaseForm, SubmittedForm, UploadedFile},
    models::{Identity, PackageRecord, ReleaseKey, ReleaseRecord},
    storage::{Repository, Store, now_ms},
};
use axum::http::StatusCode;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct UploadSubmission {
    pub form: SubmittedForm,
    pub file: Option<UploadedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    PackageRegistered {
        package: String,
    },
    ReleaseStored {
        package: String,
        version: String,
        filename: String,
        overwritten: bool,
    },
}

/// Registers or updates a package and, when a file is attached, stores a
/// release for it.
///
/// The store write lock is held for the whole call. Unless
/// `policy.atomic` is set, package and classifier changes are persisted
/// before the release is validated and survive a release failure.
#[instrument(
    skip(store, policy, submission),
    fields(
        user = %identity.username,
        package = submission.form.get("name").unwrap_or_default(),
        has_file = submission.file.is_some(),
        atomic = policy.atomic
    )
)]
pub async fn submit_package_or_release(
    store: &Store,
    policy: &UploadPolicy,
    identity: &Identity,
    submission: UploadSubmission,
) -> Result<UploadOutcome, RegistryError> {
    let UploadSubmission { form, file } = submission;
    let mut txn = store.begin_upload().await;

    let requested_name = form.get("name").unwrap_or_default();
    let existing = txn.find_package_normalized(requested_name).cloned();
    if let Some(package) = &existing
        && package.owner != identity.username
    {
        warn!(owner = package.owner, "upload rejected: package owned by another user");
        return Err(RegistryError::http(
            StatusCode::FORBIDDEN,
            API_ERROR_PACKAGE_OWNED_BY_OTHER,
        ));
    }

    let valid_package = PackageForm::validate(&form).inspect_err(|errors| {
        debug!(%errors, "package form rejected");
    })?;

    // an existing package keeps the spelling it was registered with
    let package_name = existing
        .as_ref()
        .map_or_else(|| valid_package.name.clone(), |package| package.name.clone());
    let now = now_ms();
    let package = match existing {
        Some(mut package) => {
            package.metadata = valid_package.metadata;
            package.updated_at = now;
            package
        }
        None => PackageRecord {
            name: package_name.clone(),
            owner: identity.username.clone(),
            classifiers: BTreeSet::new(),
            metadata: valid_package.metadata,
            created_at: now,
            updated_at: now,
        },
    };
    txn.upsert_package(package);

    for classifier in form.get_all("classifiers") {
        let (record, created) = txn.get_or_create_classifier(classifier);
        if created {
            debug!(classifier = record.name, "created classifier");
        }
        txn.add_package_classifier(&package_name, &record.name);
    }

    if !policy.atomic {
        txn.checkpoint().await?;
    }

    let Some(file) = file else {
        if policy.atomic {
            txn.commit().await?;
        }
        info!("package registered");
        return Ok(UploadOutcome::PackageRegistered {
            package: package_name,
        });
    };

    let lookup = ReleaseKey::new(
        &package_name,
        form.get("version").unwrap_or_default(),
        &file.filename,
    );
    let overwritten = match txn.find_release(&lookup) {
        Some(release) if !policy.allow_version_overwrite => {
            warn!(release = release.label(), filename = file.filename, "duplicate upload rejected");
            return Err(RegistryError::http(
                StatusCode::FORBIDDEN,
                already_exists_message(&file.filename, &release.label()),
            ));
        }
        Some(_) => true,
        None => false,
    };

    let valid_release = ReleaseForm::validate(&form, Some(&file)).inspect_err(|errors| {
        debug!(%errors, "release form rejected");
    })?;

    let key = ReleaseKey::new(
        &package_name,
        &valid_release.version,
        &valid_release.filename,
    );
    let backend = store.dist_backend();
    let previous = if backend.exists(&key).await? {
        backend.get(&key).await?
    } else {
        None
    };
    backend.replace(&key, &file.content).await?;

    txn.upsert_release(ReleaseRecord {
        package: key.package.clone(),
        version: key.version.clone(),
        filename: key.filename.clone(),
        filetype: valid_release.filetype,
        pyversion: valid_release.pyversion,
        comment: valid_release.comment,
        md5_digest: valid_release.md5_digest,
        sha256_digest: valid_release.sha256_digest,
        size: valid_release.size,
        uploaded_by: identity.username.clone(),
        uploaded_at: now_ms(),
    });

    if let Err(err) = txn.commit().await {
        let cleanup = match &previous {
            Some(bytes) => backend.replace(&key, bytes).await,
            None => backend.delete(&key).await.map(|_| ()),
        };
        match cleanup {
            Ok(()) => debug!(
                restored = previous.is_some(),
                "rolled back distribution after failed commit"
            ),
            Err(cleanup) => warn!(error = %cleanup, "failed to roll back distribution"),
        }
        return Err(err);
    }

    info!(
        version = key.version,
        filename = key.filename,
        overwritten,
        "release stored"
    );
    Ok(UploadOutcome::ReleaseStored {
        package: key.package,
        version: key.version,
        filename: key.filename,
        overwritten,
    })
}
