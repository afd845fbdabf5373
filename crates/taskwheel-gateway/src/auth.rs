//! Basic Auth for the whole router.
//!
//! Enabled when the configured auth file exists with `"enabled": true`. The
//! file stores either a plaintext `password` (hashed on load) or a
//! `password_sha256` hex digest — never both. Verification compares sha256
//! digests in constant time.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub realm: String,
    password_sha256: String,
}

#[derive(Debug, Deserialize)]
struct AuthFile {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_sha256: Option<String>,
    #[serde(default)]
    realm: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl AuthConfig {
    pub fn verify(&self, username: &str, password: &str) -> bool {
        if username != self.username {
            return false;
        }
        constant_time_eq(
            sha256_hex(password).as_bytes(),
            self.password_sha256.as_bytes(),
        )
    }
}

/// Load the auth file. A missing file or `enabled: false` disables auth; a
/// present-but-broken file is an error so a typo never silently exposes the
/// UI.
pub fn load_auth_config(path: &str) -> Result<Option<AuthConfig>, String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("cannot read auth file {path}: {e}")),
    };
    let file: AuthFile =
        serde_json::from_str(&raw).map_err(|e| format!("invalid auth file {path}: {e}"))?;
    if !file.enabled {
        return Ok(None);
    }

    let username = file
        .username
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| format!("auth file {path} is missing username"))?
        .to_string();
    let password_sha256 = match (file.password, file.password_sha256) {
        (Some(_), Some(_)) => {
            return Err(format!(
                "auth file {path} must set only one of password / password_sha256"
            ))
        }
        (Some(plain), None) => sha256_hex(&plain),
        (None, Some(hash)) => hash.trim().to_lowercase(),
        (None, None) => {
            return Err(format!(
                "auth file {path} is missing password / password_sha256"
            ))
        }
    };
    let realm = file
        .realm
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Taskwheel".to_string());

    Ok(Some(AuthConfig {
        username,
        realm,
        password_sha256,
    }))
}

/// Router middleware: every request passes or gets the 401 challenge.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic_header);
    if let Some((username, password)) = credentials {
        if auth.verify(&username, &password) {
            return next.run(request).await;
        }
        warn!(%username, "basic auth rejected");
    }

    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{}\", charset=\"UTF-8\"", auth.realm),
        )],
        "Authentication required",
    )
        .into_response()
}

/// Decode `Authorization: Basic <base64(user:pass)>`.
pub fn parse_basic_header(header: &str) -> Option<(String, String)> {
    let token = header.strip_prefix("Basic ")?.trim();
    let decoded = BASE64_STANDARD.decode(token).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_auth(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("auth.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{body}").unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn missing_file_disables_auth() {
        assert!(load_auth_config("/nonexistent/auth.json").unwrap().is_none());
    }

    #[test]
    fn disabled_file_disables_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_auth(&dir, r#"{"enabled": false, "username": "ops"}"#);
        assert!(load_auth_config(&path).unwrap().is_none());
    }

    #[test]
    fn plaintext_password_is_hashed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_auth(&dir, r#"{"username": "ops", "password": "hunter2"}"#);
        let auth = load_auth_config(&path).unwrap().unwrap();
        assert!(auth.verify("ops", "hunter2"));
        assert!(!auth.verify("ops", "hunter3"));
        assert!(!auth.verify("nops", "hunter2"));
        assert_eq!(auth.realm, "Taskwheel");
    }

    #[test]
    fn prehashed_password_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let hash = sha256_hex("s3cret");
        let path = write_auth(
            &dir,
            &format!(r#"{{"username": "ops", "password_sha256": "{hash}", "realm": "Ops"}}"#),
        );
        let auth = load_auth_config(&path).unwrap().unwrap();
        assert!(auth.verify("ops", "s3cret"));
        assert_eq!(auth.realm, "Ops");
    }

    #[test]
    fn both_password_fields_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_auth(
            &dir,
            r#"{"username": "ops", "password": "a", "password_sha256": "b"}"#,
        );
        assert!(load_auth_config(&path).is_err());
    }

    #[test]
    fn missing_username_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_auth(&dir, r#"{"password": "a"}"#);
        assert!(load_auth_config(&path).is_err());
    }

    #[test]
    fn basic_header_round_trip() {
        let token = BASE64_STANDARD.encode("ops:pass:with:colons");
        let header = format!("Basic {token}");
        let (user, pass) = parse_basic_header(&header).unwrap();
        assert_eq!(user, "ops");
        assert_eq!(pass, "pass:with:colons");

        assert!(parse_basic_header("Bearer abc").is_none());
        assert!(parse_basic_header("Basic !!notbase64!!").is_none());
        let no_colon = BASE64_STANDARD.encode("justuser");
        assert!(parse_basic_header(&format!("Basic {no_colon}")).is_none());
    }
}
