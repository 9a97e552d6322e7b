pub const HEADER_JSON: &str = "application/json";
pub const HEADER_TEXT: &str = "text/plain; charset=utf-8";
pub const HEADER_HTML: &str = "text/html; charset=utf-8";
pub const HEADER_OCTET: &str = "application/octet-stream";

pub const BASIC_AUTH_REALM: &str = "pypi";

pub const API_ERROR_NOT_LOGGED_IN: &str = "Not logged in, or invalid username/password.";
pub const API_ERROR_BAD_USERNAME_PASSWORD: &str = "bad username/password, access denied";
pub const API_ERROR_PASSWORD_SHORT: &str = "password is too short";
pub const API_ERROR_USERNAME_ALREADY_REGISTERED: &str = "username is already registered";
pub const API_ERROR_PACKAGE_OWNED_BY_OTHER: &str = "That package is owned by someone else!";
pub const API_ERROR_NO_PACKAGE: &str = "no such package available";
pub const API_ERROR_NO_SUCH_FILE: &str = "no such file available";
pub const API_ERROR_NOT_FOUND: &str = "not found";
pub const API_ERROR_BODY_TOO_LARGE: &str = "request entity too large";
pub const API_ERROR_MALFORMED_FORM: &str = "malformed multipart form";

pub const STATE_FILE_NAME: &str = "state.json";
pub const DISTRIBUTIONS_DIR_NAME: &str = "distributions";

pub const DEFAULT_FILETYPE: &str = "sdist";
pub const ALLOWED_FILETYPES: &[&str] = &[
    "sdist",
    "bdist_wheel",
    "bdist_egg",
    "bdist_dumb",
    "bdist_rpm",
    "bdist_wininst",
    "bdist_msi",
];
pub const ALLOWED_DIST_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tgz", ".zip", ".whl", ".egg",
];

pub fn already_exists_message(filename: &str, release: &str) -> String {
    format!("A file named '{filename}' already exists for {release}. Please create a new release.")
}
