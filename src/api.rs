use crate::{
    app::AppState,
    auth::parse_basic_authorization,
    constants::{
        API_ERROR_BODY_TOO_LARGE, API_ERROR_MALFORMED_FORM, API_ERROR_NO_PACKAGE,
        API_ERROR_NO_SUCH_FILE, API_ERROR_NOT_FOUND, API_ERROR_NOT_LOGGED_IN, HEADER_HTML,
        HEADER_JSON, HEADER_OCTET, HEADER_TEXT,
    },
    error::RegistryError,
    forms::{SubmittedForm, UploadedFile},
    models::{Identity, PackageRecord, ReleaseKey, ReleaseRecord},
    storage::{Store, normalize_project_name},
    upload::{UploadSubmission, submit_package_or_release},
};
use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Request, State, multipart::MultipartError},
    http::{HeaderMap, Method, Response, StatusCode, header},
};
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

const DISTRIBUTION_FIELDS: &[&str] = &["distribution", "content"];

#[instrument(skip_all, fields(method = tracing::field::Empty, path = tracing::field::Empty))]
pub async fn dispatch(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, RegistryError> {
    let method = req.method().clone();
    let raw_path = req.uri().path().to_string();
    let Some(path) = normalize_incoming_path(&raw_path, &state.url_prefix) else {
        warn!(
            raw_path,
            url_prefix = state.url_prefix.as_str(),
            "request path did not match configured url_prefix"
        );
        return Err(not_found(API_ERROR_NOT_FOUND));
    };
    let span = tracing::Span::current();
    span.record("method", tracing::field::display(&method));
    span.record("path", tracing::field::display(&raw_path));
    debug!("dispatching request");

    if method == Method::POST && (path == "/" || path == "/legacy" || path == "/legacy/") {
        return handle_upload(&state, req).await;
    }

    let is_head = method == Method::HEAD;
    if method != Method::GET && !is_head {
        return Err(RegistryError::http(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }

    if path == "/-/ping" {
        return Ok(json_response(StatusCode::OK, json!({})));
    }

    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(decode_path_component)
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let response = match segments.as_slice() {
        ["simple"] | ["simple", ""] => simple_index(&state).await,
        ["simple", name] | ["simple", name, ""] => simple_project(&state, name).await?,
        ["packages", name, version, filename] => {
            download_distribution(&state.store, name, version, filename).await?
        }
        ["pypi", name, "json"] | ["pypi", name, "json", ""] => {
            package_json(&state, name).await?
        }
        _ => return Err(not_found(API_ERROR_NOT_FOUND)),
    };

    Ok(if is_head {
        head_response(response)
    } else {
        response
    })
}

async fn handle_upload(state: &AppState, req: Request<Body>) -> Result<Response<Body>, RegistryError> {
    let identity = resolve_identity(&state.store, req.headers()).await?;
    let submission = read_submission(state, req).await?;
    debug!(
        fields = submission.form.len(),
        has_file = submission.file.is_some(),
        "parsed upload form"
    );

    submit_package_or_release(&state.store, &state.upload, &identity, submission).await?;
    Ok(text_response(StatusCode::OK, HEADER_TEXT, String::new()))
}

async fn resolve_identity(store: &Store, headers: &HeaderMap) -> Result<Identity, RegistryError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let Some(credentials) = parse_basic_authorization(raw) else {
        warn!(
            authorization_header = raw.is_some(),
            "upload without usable basic credentials"
        );
        return Err(RegistryError::http(
            StatusCode::UNAUTHORIZED,
            API_ERROR_NOT_LOGGED_IN,
        ));
    };

    store
        .verify_credentials(&credentials.username, &credentials.password)
        .await
}

async fn read_submission(
    state: &AppState,
    req: Request<Body>,
) -> Result<UploadSubmission, RegistryError> {
    let mut multipart = Multipart::from_request(req, state).await.map_err(|rejection| {
        debug!(error = %rejection, "request is not a multipart form");
        RegistryError::http(StatusCode::BAD_REQUEST, API_ERROR_MALFORMED_FORM)
    })?;

    let mut form = SubmittedForm::default();
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };
        match field.file_name().map(ToOwned::to_owned) {
            Some(filename) if DISTRIBUTION_FIELDS.contains(&name.as_str()) => {
                let content = field.bytes().await.map_err(multipart_error)?;
                file = Some(UploadedFile {
                    filename,
                    content: content.to_vec(),
                });
            }
            Some(filename) => {
                // signatures and other attachments are not stored
                let skipped = field.bytes().await.map_err(multipart_error)?;
                debug!(field = name, filename, bytes = skipped.len(), "ignoring file field");
            }
            None => {
                let value = field.text().await.map_err(multipart_error)?;
                form.push(name, value);
            }
        }
    }

    Ok(UploadSubmission { form, file })
}

fn multipart_error(err: MultipartError) -> RegistryError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("upload exceeded max body size");
        return RegistryError::http(StatusCode::PAYLOAD_TOO_LARGE, API_ERROR_BODY_TOO_LARGE);
    }
    debug!(error = %err.body_text(), "malformed multipart body");
    RegistryError::http(StatusCode::BAD_REQUEST, API_ERROR_MALFORMED_FORM)
}

async fn simple_index(state: &AppState) -> Response<Body> {
    let packages = state.store.all_packages().await;
    let mut body = String::from(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <title>Simple index</title>\n  </head>\n  <body>\n",
    );
    for package in packages {
        let href = prefixed_route_path(
            &state.url_prefix,
            &format!("/simple/{}/", normalize_project_name(&package.name)),
        );
        body.push_str(&format!(
            "    <a href=\"{}\">{}</a><br/>\n",
            escape_html(&href),
            escape_html(&package.name)
        ));
    }
    body.push_str("  </body>\n</html>\n");
    text_response(StatusCode::OK, HEADER_HTML, body)
}

async fn simple_project(state: &AppState, name: &str) -> Result<Response<Body>, RegistryError> {
    let package = find_package(&state.store, name).await?;
    let releases = state.store.releases_for_package(&package.name).await;

    let mut body = format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <title>Links for {0}</title>\n  </head>\n  <body>\n    <h1>Links for {0}</h1>\n",
        escape_html(&package.name)
    );
    for release in &releases {
        body.push_str(&format!(
            "    <a href=\"{}#sha256={}\">{}</a><br/>\n",
            escape_html(&download_path(&state.url_prefix, release)),
            release.sha256_digest,
            escape_html(&release.filename)
        ));
    }
    body.push_str("  </body>\n</html>\n");
    Ok(text_response(StatusCode::OK, HEADER_HTML, body))
}

async fn download_distribution(
    store: &Store,
    name: &str,
    version: &str,
    filename: &str,
) -> Result<Response<Body>, RegistryError> {
    let package = find_package(store, name).await?;
    let key = ReleaseKey::new(package.name, version, filename);
    let Some(bytes) = store.read_distribution(&key).await? else {
        debug!(object = %key.storage_key(), "distribution not found");
        return Err(not_found(API_ERROR_NO_SUCH_FILE));
    };
    Ok(bytes_response(StatusCode::OK, bytes))
}

async fn package_json(state: &AppState, name: &str) -> Result<Response<Body>, RegistryError> {
    let package = find_package(&state.store, name).await?;
    let releases = state.store.releases_for_package(&package.name).await;

    let mut by_version: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for release in &releases {
        by_version
            .entry(release.version.clone())
            .or_default()
            .push(release_file_json(&state.url_prefix, release));
    }
    let latest = releases
        .iter()
        .max_by_key(|release| release.uploaded_at)
        .map(|release| release.version.clone());

    let metadata = &package.metadata;
    let body = json!({
        "info": {
            "name": package.name,
            "owner": package.owner,
            "version": latest,
            "summary": metadata.summary,
            "description": metadata.description,
            "author": metadata.author,
            "author_email": metadata.author_email,
            "maintainer": metadata.maintainer,
            "maintainer_email": metadata.maintainer_email,
            "home_page": metadata.home_page,
            "download_url": metadata.download_url,
            "license": metadata.license,
            "keywords": metadata.keywords,
            "platform": metadata.platform,
            "classifiers": package.classifiers,
        },
        "releases": by_version
            .into_iter()
            .map(|(version, files)| (version, Value::Array(files)))
            .collect::<Map<String, Value>>(),
    });
    Ok(json_response(StatusCode::OK, body))
}

fn release_file_json(url_prefix: &str, release: &ReleaseRecord) -> Value {
    json!({
        "filename": release.filename,
        "packagetype": release.filetype,
        "python_version": release.pyversion,
        "comment_text": release.comment,
        "size": release.size,
        "digests": {
            "sha256": release.sha256_digest,
            "md5": release.md5_digest,
        },
        "url": download_path(url_prefix, release),
        "uploaded_by": release.uploaded_by,
        "upload_time": format_timestamp(release.uploaded_at),
    })
}

async fn find_package(store: &Store, name: &str) -> Result<PackageRecord, RegistryError> {
    store
        .find_package_normalized(name)
        .await
        .ok_or_else(|| not_found(API_ERROR_NO_PACKAGE))
}

fn download_path(url_prefix: &str, release: &ReleaseRecord) -> String {
    prefixed_route_path(
        url_prefix,
        &format!(
            "/packages/{}/{}/{}",
            urlencoding::encode(&release.package),
            urlencoding::encode(&release.version),
            urlencoding::encode(&release.filename)
        ),
    )
}

fn format_timestamp(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn not_found(message: &str) -> RegistryError {
    RegistryError::http(StatusCode::NOT_FOUND, message)
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::from(String::new())))
}

fn decode_path_component(value: &str) -> String {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn normalize_incoming_path(path: &str, url_prefix: &str) -> Option<String> {
    if url_prefix == "/" {
        return Some(path.to_string());
    }

    if path == url_prefix {
        return Some("/".to_string());
    }

    let prefix_with_slash = format!("{url_prefix}/");
    if let Some(stripped) = path.strip_prefix(&prefix_with_slash) {
        return Some(format!("/{stripped}"));
    }

    None
}

fn prefixed_route_path(url_prefix: &str, path: &str) -> String {
    if url_prefix == "/" {
        path.to_string()
    } else {
        format!("{}{}", url_prefix.trim_end_matches('/'), path)
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HEADER_JSON)
        .body(Body::from(payload))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

fn bytes_response(status: StatusCode, bytes: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HEADER_OCTET)
        .header(header::CONTENT_LENGTH, bytes.len().to_string())
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::from(Vec::<u8>::new())))
}

fn head_response(mut response: Response<Body>) -> Response<Body> {
    *response.body_mut() = Body::empty();
    response
}

#[cfg(test)]
mod tests {
    use super::{escape_html, format_timestamp, normalize_incoming_path, prefixed_route_path};

    #[test]
    fn strips_configured_url_prefix() {
        assert_eq!(normalize_incoming_path("/simple/", "/"), Some("/simple/".to_string()));
        assert_eq!(normalize_incoming_path("/pypi", "/pypi"), Some("/".to_string()));
        assert_eq!(
            normalize_incoming_path("/pypi/simple/demo/", "/pypi"),
            Some("/simple/demo/".to_string())
        );
        assert_eq!(normalize_incoming_path("/other/simple/", "/pypi"), None);
    }

    #[test]
    fn prefixes_generated_links() {
        assert_eq!(prefixed_route_path("/", "/simple/demo/"), "/simple/demo/");
        assert_eq!(prefixed_route_path("/pypi", "/simple/demo/"), "/pypi/simple/demo/");
    }

    #[test]
    fn escapes_markup_in_links() {
        assert_eq!(escape_html("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
    }

    #[test]
    fn formats_upload_time_as_utc() {
        assert_eq!(
            format_timestamp(0).as_deref(),
            Some("1970-01-01T00:00:00Z")
        );
    }
}
