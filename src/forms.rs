//! Validation of the distutils `register`/`upload` form.
//!
//! The package and release halves are validated separately because the
//! upload flow commits the package before the release is looked at.

use crate::{
    constants::{ALLOWED_DIST_EXTENSIONS, ALLOWED_FILETYPES, DEFAULT_FILETYPE},
    models::PackageMetadata,
};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt};

const REQUIRED: &str = "This field is required.";
const MAX_NAME_LEN: usize = 200;
const MAX_SUMMARY_LEN: usize = 512;
const MAX_VERSION_LEN: usize = 128;
const MAX_FILENAME_LEN: usize = 255;

/// Field-level validation errors, rendered as `field: message; ...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors {
    errors: BTreeMap<String, Vec<String>>,
}

impl FieldErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.errors.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    fn into_result<T>(self, value: T) -> Result<T, FieldErrors> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.errors {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Vec<u8>,
}

/// Text fields of a submitted form, in submission order.
#[derive(Debug, Clone, Default)]
pub struct SubmittedForm {
    fields: Vec<(String, String)>,
}

impl SubmittedForm {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Last non-blank value for `name`, trimmed.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .find(|value| !value.is_empty())
    }

    /// Every non-blank value for a repeatable field, in order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for SubmittedForm
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut form = Self::default();
        for (key, value) in iter {
            form.push(key, value);
        }
        form
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPackage {
    pub name: String,
    pub metadata: PackageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRelease {
    pub version: String,
    pub filename: String,
    pub filetype: String,
    pub pyversion: Option<String>,
    pub comment: Option<String>,
    pub md5_digest: Option<String>,
    pub sha256_digest: String,
    pub size: u64,
}

pub struct PackageForm;

impl PackageForm {
    pub fn validate(form: &SubmittedForm) -> Result<ValidPackage, FieldErrors> {
        let mut errors = FieldErrors::default();

        let name = form.get("name").unwrap_or_default();
        if name.is_empty() {
            errors.add("name", REQUIRED);
        } else if let Err(message) = check_package_name(name) {
            errors.add("name", message);
        }

        let metadata = PackageMetadata {
            summary: optional(form, "summary"),
            description: optional(form, "description"),
            author: optional(form, "author"),
            author_email: optional(form, "author_email"),
            maintainer: optional(form, "maintainer"),
            maintainer_email: optional(form, "maintainer_email"),
            home_page: optional(form, "home_page"),
            download_url: optional(form, "download_url"),
            license: optional(form, "license"),
            keywords: optional(form, "keywords"),
            platform: optional(form, "platform"),
        };

        if let Some(summary) = &metadata.summary
            && summary.chars().count() > MAX_SUMMARY_LEN
        {
            errors.add(
                "summary",
                format!("Ensure this value has at most {MAX_SUMMARY_LEN} characters."),
            );
        }
        for (field, value) in [
            ("author_email", &metadata.author_email),
            ("maintainer_email", &metadata.maintainer_email),
        ] {
            if let Some(email) = value
                && !email.contains('@')
            {
                errors.add(field, "Enter a valid email address.");
            }
        }
        for (field, value) in [
            ("home_page", &metadata.home_page),
            ("download_url", &metadata.download_url),
        ] {
            if let Some(url) = value
                && !(url.starts_with("http://") || url.starts_with("https://"))
            {
                errors.add(field, "Enter a valid URL.");
            }
        }

        errors.into_result(ValidPackage {
            name: name.to_string(),
            metadata,
        })
    }
}

pub struct ReleaseForm;

impl ReleaseForm {
    pub fn validate(
        form: &SubmittedForm,
        file: Option<&UploadedFile>,
    ) -> Result<ValidRelease, FieldErrors> {
        let mut errors = FieldErrors::default();

        let version = form.get("version").unwrap_or_default();
        if version.is_empty() {
            errors.add("version", REQUIRED);
        } else if version.chars().count() > MAX_VERSION_LEN {
            errors.add(
                "version",
                format!("Ensure this value has at most {MAX_VERSION_LEN} characters."),
            );
        } else if version.contains("..")
            || version
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\'))
        {
            errors.add("version", "Version may not contain whitespace or path components.");
        }

        let (filename, content) = match file {
            Some(file) => (file.filename.as_str(), file.content.as_slice()),
            None => ("", &[][..]),
        };
        if file.is_none() {
            errors.add("distribution", REQUIRED);
        } else if let Err(message) = check_distribution_filename(filename) {
            errors.add("distribution", message);
        } else if content.is_empty() {
            errors.add("distribution", "The submitted file is empty.");
        }

        let filetype = form.get("filetype").unwrap_or(DEFAULT_FILETYPE);
        if !ALLOWED_FILETYPES.contains(&filetype) {
            errors.add(
                "filetype",
                format!("Select a valid choice. {filetype} is not one of the available choices."),
            );
        }

        let md5_digest = optional(form, "md5_digest").map(|d| d.to_ascii_lowercase());
        if let Some(digest) = &md5_digest
            && !is_hex_of_len(digest, 32)
        {
            errors.add("md5_digest", "Enter a valid MD5 hex digest.");
        }

        let sha256_digest = sha256_hex(content);
        if let Some(claimed) = optional(form, "sha256_digest") {
            if !is_hex_of_len(&claimed, 64) {
                errors.add("sha256_digest", "Enter a valid SHA256 hex digest.");
            } else if file.is_some() && !claimed.eq_ignore_ascii_case(&sha256_digest) {
                errors.add(
                    "sha256_digest",
                    "Digest does not match the uploaded content.",
                );
            }
        }

        errors.into_result(ValidRelease {
            version: version.to_string(),
            filename: filename.to_string(),
            filetype: filetype.to_string(),
            pyversion: optional(form, "pyversion"),
            comment: optional(form, "comment"),
            md5_digest,
            sha256_digest,
            size: content.len() as u64,
        })
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn optional(form: &SubmittedForm, field: &str) -> Option<String> {
    form.get(field).map(ToOwned::to_owned)
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_package_name(name: &str) -> Result<(), String> {
    if name.chars().count() > MAX_NAME_LEN {
        return Err(format!(
            "Ensure this value has at most {MAX_NAME_LEN} characters."
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(
            "Package names may only contain letters, digits, '.', '_' and '-'.".to_string(),
        );
    }
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = name
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err("Package names must start and end with a letter or digit.".to_string());
    }
    Ok(())
}

fn check_distribution_filename(filename: &str) -> Result<(), String> {
    if filename.is_empty() {
        return Err("The submitted file has no name.".to_string());
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(format!(
            "Filename too long: {} characters (max: {MAX_FILENAME_LEN}).",
            filename.len()
        ));
    }
    if filename.chars().any(char::is_control) {
        return Err("Filename contains control characters.".to_string());
    }
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err("Filename may not contain path components.".to_string());
    }
    let lower = filename.to_ascii_lowercase();
    if !ALLOWED_DIST_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext) && lower.len() > ext.len())
    {
        return Err(format!(
            "Unsupported distribution type, expected one of: {}.",
            ALLOWED_DIST_EXTENSIONS.join(", ")
        ));
    }
    Ok(())
}
