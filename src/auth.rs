use crate::{error::RegistryError, models::Identity};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

/// Credential check supplied by an embedding application.
///
/// The hook is consulted before the local user table. Returning `Ok(None)`
/// falls through to local users; `Ok(Some(_))` accepts the caller as that
/// identity; an error rejects the request.
#[async_trait]
pub trait AuthHook: Send + Sync {
    async fn authenticate(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Option<Identity>, RegistryError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parses an `Authorization: Basic <base64(user:pass)>` header value.
pub fn parse_basic_authorization(header: Option<&str>) -> Option<BasicCredentials> {
    let value = header?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = B64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username.is_empty() {
        return None;
    }
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}
