// OAuth 2.0 authorization code + PKCE against the Microsoft identity platform, with a
// loopback redirect listener.

use super::TokenSet;
use crate::auth::claims::read_claims;
use crate::error::{ServiceError, ServiceResult};
use crate::security::crypto;
use crate::utils::cancel;
use crate::utils::logging::mask_url_secrets;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use url::Url;

/// How long one loopback connection may take to send its request line.
const REDIRECT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub app_id: String,
    /// e.g. `https://login.microsoftonline.com/organizations`
    pub authority: String,
    /// Dataverse environment URL; the token audience.
    pub resource: String,
    pub login_timeout: Duration,
    pub open_browser: bool,
}

impl OAuthConfig {
    pub fn scope(&self) -> String {
        format!(
            "{}/user_impersonation offline_access openid profile",
            self.resource.trim().trim_end_matches('/')
        )
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/oauth2/v2.0/{}",
            self.authority.trim().trim_end_matches('/'),
            name
        )
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Query parameters delivered to the loopback redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectParams {
    Code { code: String, state: Option<String> },
    Error { error: String, description: Option<String> },
    /// Favicon and other stray requests.
    Ignored,
}

pub struct OAuthClient {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig, timeout: Duration) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::remote(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn authorize_url(
        &self,
        redirect_uri: &str,
        code_challenge: &str,
        state: &str,
    ) -> ServiceResult<Url> {
        let mut url = Url::parse(&self.config.endpoint("authorize"))
            .map_err(|e| ServiceError::InvalidArgument(format!("Invalid authority: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.app_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &self.config.scope())
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "select_account");
        Ok(url)
    }

    /// Interactive sign-in. `on_url` receives the authorization URL so the caller can show
    /// it; the system browser is opened too when configured.
    pub async fn sign_in_interactive<F>(
        &self,
        on_url: F,
        cancel: &CancellationToken,
    ) -> ServiceResult<TokenSet>
    where
        F: FnOnce(&str) + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ServiceError::remote(format!("Failed to open sign-in listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| ServiceError::remote(format!("Failed to read listener port: {}", e)))?
            .port();
        let redirect_uri = format!("http://localhost:{}", port);

        let verifier = crypto::pkce_verifier().map_err(|e| ServiceError::remote(e.to_string()))?;
        let state = crypto::random_url_safe(16).map_err(|e| ServiceError::remote(e.to_string()))?;
        let url = self.authorize_url(&redirect_uri, &crypto::pkce_challenge(&verifier), &state)?;

        info!(
            "[PHASE: auth] [STEP: interactive] Waiting for sign-in on {}",
            redirect_uri
        );
        on_url(url.as_str());
        if self.config.open_browser && !open_browser(url.as_str()) {
            warn!("[PHASE: auth] [STEP: interactive] Could not launch a browser; URL shown on screen");
        }

        let wait = wait_for_code(&listener, &state, REDIRECT_READ_TIMEOUT);
        let code = cancel::run(cancel, async {
            tokio::time::timeout(self.config.login_timeout, wait)
                .await
                .map_err(|_| ServiceError::remote("Sign-in timed out"))?
        })
        .await?;

        self.redeem_code(&code, &redirect_uri, &verifier, cancel).await
    }

    pub async fn redeem_code(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<TokenSet> {
        let scope = self.config.scope();
        let form = [
            ("client_id", self.config.app_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
            ("scope", scope.as_str()),
        ];
        self.token_request(&form, None, cancel).await
    }

    pub async fn refresh(
        &self,
        refresh_token: &str,
        cancel: &CancellationToken,
    ) -> ServiceResult<TokenSet> {
        debug!("[PHASE: auth] [STEP: refresh] Refreshing access token");
        let scope = self.config.scope();
        let form = [
            ("client_id", self.config.app_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        self.token_request(&form, Some(refresh_token), cancel).await
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        previous_refresh: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<TokenSet> {
        let endpoint = self.config.endpoint("token");
        let (status, body) = cancel::run(cancel, async {
            let resp = self.http.post(&endpoint).form(form).send().await?;
            let status = resp.status();
            Ok((status, resp.text().await?))
        })
        .await?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(e) => (
                    Some(e.error.clone()),
                    e.error_description.unwrap_or(e.error),
                ),
                Err(_) => (None, format!("Token endpoint returned {}", status)),
            };
            warn!(
                "[PHASE: auth] [STEP: token] Token request failed: {}",
                mask_url_secrets(&message)
            );
            return Err(ServiceError::remote_status(
                status.as_u16(),
                code,
                first_line(&message),
            ));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let expires_at = Utc::now() + ChronoDuration::seconds(parsed.expires_in.unwrap_or(3600));
        let account = read_claims(&parsed.access_token)
            .ok()
            .and_then(|c| c.account().map(str::to_string));
        info!(
            "[PHASE: auth] [STEP: token] Token acquired (fp={}) for {}",
            crypto::token_fingerprint(&parsed.access_token),
            account.as_deref().unwrap_or("unknown account")
        );
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
            account,
        })
    }
}

// AADSTS descriptions carry trace ids and timestamps on later lines.
fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or(message).trim().to_string()
}

async fn wait_for_code(
    listener: &TcpListener,
    expected_state: &str,
    read_timeout: Duration,
) -> ServiceResult<String> {
    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| ServiceError::remote(format!("Sign-in listener failed: {}", e)))?;
        // Browsers open speculative connections that may never send anything.
        let Ok(request_line) =
            tokio::time::timeout(read_timeout, read_request_line(&mut stream)).await
        else {
            debug!("[PHASE: auth] [STEP: redirect] Dropping idle connection");
            continue;
        };

        let params = match request_line.as_deref().map(parse_redirect_request) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                debug!("[PHASE: auth] [STEP: redirect] Ignoring malformed request: {}", e);
                RedirectParams::Ignored
            }
            None => RedirectParams::Ignored,
        };

        match params {
            RedirectParams::Ignored => {
                respond(&mut stream, "404 Not Found", "").await;
            }
            RedirectParams::Error { error, description } => {
                respond(&mut stream, "200 OK", &landing_page(false)).await;
                return Err(ServiceError::RemoteFailure {
                    status: None,
                    code: Some(error.clone()),
                    message: first_line(description.as_deref().unwrap_or(&error)),
                });
            }
            RedirectParams::Code { code, state } => {
                if state.as_deref() != Some(expected_state) {
                    respond(&mut stream, "400 Bad Request", &landing_page(false)).await;
                    return Err(ServiceError::remote(
                        "Sign-in response did not match this request (state mismatch)",
                    ));
                }
                respond(&mut stream, "200 OK", &landing_page(true)).await;
                return Ok(code);
            }
        }
    }
}

async fn read_request_line(stream: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 8192];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await.ok()?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf[..filled]);
    text.lines().next().map(str::to_string)
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

fn landing_page(success: bool) -> String {
    let message = if success {
        "Sign-in complete. You can close this window and return to the terminal."
    } else {
        "Sign-in failed. Return to the terminal for details."
    };
    format!(
        "<!doctype html><html><head><title>Dataverse Mapping Remover</title></head><body><p>{}</p></body></html>",
        message
    )
}

/// Parse `GET /?code=...&state=... HTTP/1.1`.
pub fn parse_redirect_request(request_line: &str) -> ServiceResult<RedirectParams> {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(ServiceError::remote("Empty redirect request"));
    };
    if method != "GET" {
        return Ok(RedirectParams::Ignored);
    }
    let url = Url::parse(&format!("http://localhost{}", target))
        .map_err(|e| ServiceError::remote(format!("Malformed redirect: {}", e)))?;
    if url.path() != "/" {
        return Ok(RedirectParams::Ignored);
    }

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            "error_description" => description = Some(v.into_owned()),
            _ => {}
        }
    }

    Ok(match (code, error) {
        (_, Some(error)) => RedirectParams::Error { error, description },
        (Some(code), None) => RedirectParams::Code { code, state },
        (None, None) => RedirectParams::Ignored,
    })
}

/// Launch the system browser. Returns false when no opener is available.
pub fn open_browser(url: &str) -> bool {
    let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "windows") {
        ("cmd", vec!["/C", "start", "", url])
    } else if cfg!(target_os = "macos") {
        ("open", vec![url])
    } else {
        ("xdg-open", vec![url])
    };

    let Ok(path) = which::which(program) else {
        debug!("[PHASE: auth] [STEP: browser] {} not found on PATH", program);
        return false;
    };
    Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .is_ok()
}
