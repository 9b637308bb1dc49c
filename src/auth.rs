//! OAuth2 installed application flow, with the resulting token cached on disk
//! so that the user only has to authorize once

use crate::config::{Config, PathBuf};
use anyhow::Context as _;
use camino::Utf8Path;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

/// Full control is needed to create buckets and change object ACLs
pub const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// The code is displayed to the user instead of being redirected anywhere
pub const REDIRECT_URL: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Access tokens within this many seconds of expiring are not reused
const EXPIRY_MARGIN: i64 = 60;

/// The token as persisted in the cache file.
///
/// This is the same layout as an `authorized_user` credential file written by
/// gcloud, with the last access token added to it
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CachedToken {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Unix timestamp the access token expires at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl CachedToken {
    /// The access token, if there is one and it won't expire soon
    pub fn valid_access_token(&self, now: i64) -> Option<&str> {
        match (&self.access_token, self.expires_at) {
            (Some(at), Some(expires_at)) if now + EXPIRY_MARGIN < expires_at => Some(at),
            _ => None,
        }
    }
}

#[inline]
fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the cached token. A missing, empty, or unparsable cache is
    /// treated as not having a token at all
    pub fn load(&self) -> anyhow::Result<Option<CachedToken>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path));
            }
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            debug!(path = %self.path, "token cache is empty");
            return Ok(None);
        }

        match serde_json::from_slice(&data) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                warn!(path = %self.path, %err, "ignoring invalid token cache");
                Ok(None)
            }
        }
    }

    /// Writes the token to the cache, replacing whatever was there before
    pub fn store(&self, token: &CachedToken) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent}"))?;
        }

        let json = serde_json::to_vec_pretty(token).context("failed to serialize token")?;
        crate::write_private(&self.path, &json)
            .with_context(|| format!("failed to write token to {}", self.path))
    }
}

/// The URL the user needs to visit to authorize access and receive a code
pub fn authorization_url(config: &Config) -> anyhow::Result<url::Url> {
    url::Url::parse_with_params(
        AUTH_URL,
        &[
            ("response_type", "code"),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", REDIRECT_URL),
            ("scope", SCOPE),
            // Without these we don't get a refresh token
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .context("failed to build authorization url")
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn token_response(res: reqwest::blocking::Response) -> anyhow::Result<TokenResponse> {
    let body = crate::success_bytes(res)?;
    serde_json::from_slice(&body).context("failed to deserialize token response")
}

/// Exchanges an authorization code for an access and refresh token
pub fn exchange_code(
    client: &Client,
    token_url: &str,
    config: &Config,
    code: &str,
) -> anyhow::Result<CachedToken> {
    let res = client
        .post(token_url)
        .form(&[
            ("code", code),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("redirect_uri", REDIRECT_URL),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .context("failed to send token request")?;

    let tr = token_response(res).context("authorization code exchange failed")?;

    let refresh_token = tr
        .refresh_token
        .context("token response did not contain a refresh token")?;

    Ok(CachedToken {
        kind: "authorized_user".to_owned(),
        client_id: config.client_id.clone(),
        client_secret: config.client_secret.clone(),
        refresh_token,
        expires_at: tr.expires_in.map(|ei| now() + ei),
        access_token: Some(tr.access_token),
    })
}

/// Uses the refresh token to acquire a new access token
pub fn refresh(
    client: &Client,
    token_url: &str,
    token: &CachedToken,
) -> anyhow::Result<CachedToken> {
    let res = client
        .post(token_url)
        .form(&[
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
            ("refresh_token", token.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .context("failed to send token refresh request")?;

    let tr = token_response(res).context("token refresh failed")?;

    Ok(CachedToken {
        // The refresh token is only sometimes rotated
        refresh_token: tr
            .refresh_token
            .unwrap_or_else(|| token.refresh_token.clone()),
        expires_at: tr.expires_in.map(|ei| now() + ei),
        access_token: Some(tr.access_token),
        ..token.clone()
    })
}

#[inline]
fn access_token(token: &CachedToken) -> anyhow::Result<&str> {
    token
        .access_token
        .as_deref()
        .context("token response did not contain an access token")
}

#[inline]
fn bearer(access_token: &str) -> anyhow::Result<http::HeaderValue> {
    let mut hv = http::HeaderValue::from_str(&format!("Bearer {access_token}"))
        .context("access token is not a valid header value")?;
    hv.set_sensitive(true);
    Ok(hv)
}

/// An authorized HTTP client
pub struct Session {
    client: Client,
}

impl Session {
    pub fn new(auth: http::HeaderValue) -> anyhow::Result<Self> {
        let hm = {
            let mut hm = reqwest::header::HeaderMap::new();
            hm.insert(http::header::AUTHORIZATION, auth);
            hm
        };

        let client = Client::builder()
            .default_headers(hm)
            .build()
            .context("failed to build client")?;

        Ok(Self { client })
    }

    #[inline]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Returned when there is no usable token and no authorization code to
/// exchange for one
#[derive(Debug, thiserror::Error)]
#[error("authorization required, visit {url} to get a code")]
pub struct AuthorizationRequired {
    pub url: url::Url,
}

enum State {
    Unauthenticated,
    Authenticated(Session),
}

pub enum Authorization<'a> {
    Authorized(&'a Session),
    /// The user needs to visit the url and rerun with the code it provides
    Required(url::Url),
}

pub struct Authenticator {
    config: Config,
    cache: TokenCache,
    client: Client,
    token_url: String,
    state: State,
}

impl Authenticator {
    pub fn new(config: Config, cache: TokenCache) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            cache,
            client: Client::builder()
                .build()
                .context("failed to build client")?,
            token_url: TOKEN_URL.to_owned(),
            state: State::Unauthenticated,
        })
    }

    /// Uses a different token endpoint than Google's
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated(_))
    }

    /// Authenticates, if not already authenticated, using the cached token, or
    /// the authorization code if the cached token can't be used
    pub fn authenticate(&mut self) -> anyhow::Result<Authorization<'_>> {
        if !self.is_authenticated() {
            let Some(auth) = self.acquire()? else {
                return Ok(Authorization::Required(authorization_url(&self.config)?));
            };

            self.state = State::Authenticated(Session::new(auth)?);
        }

        match &self.state {
            State::Authenticated(session) => Ok(Authorization::Authorized(session)),
            State::Unauthenticated => unreachable!("authentication state was just set"),
        }
    }

    /// The authorized session, failing with [`AuthorizationRequired`] if the
    /// user needs to authorize first
    pub fn session(&mut self) -> anyhow::Result<&Session> {
        match self.authenticate()? {
            Authorization::Authorized(session) => Ok(session),
            Authorization::Required(url) => Err(AuthorizationRequired { url }.into()),
        }
    }

    fn acquire(&mut self) -> anyhow::Result<Option<http::HeaderValue>> {
        if let Some(token) = self.cache.load()? {
            if token.client_id != self.config.client_id {
                warn!("cached token was issued to a different client, ignoring it");
            } else if let Some(at) = token.valid_access_token(now()) {
                debug!("using cached access token");
                return Ok(Some(bearer(at)?));
            } else {
                match refresh(&self.client, &self.token_url, &token) {
                    Ok(refreshed) => {
                        debug!("refreshed access token");
                        if let Err(err) = self.cache.store(&refreshed) {
                            warn!("failed to cache refreshed token: {err:#}");
                        }
                        return Ok(Some(bearer(access_token(&refreshed)?)?));
                    }
                    Err(err) => warn!("cached token could not be refreshed: {err:#}"),
                }
            }
        }

        let Some(code) = self.config.code.as_deref() else {
            return Ok(None);
        };

        let token = exchange_code(&self.client, &self.token_url, &self.config, code)?;
        self.cache.store(&token)?;
        info!("Token is cached in {}", self.cache.path());

        Ok(Some(bearer(access_token(&token)?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cache: &Utf8Path, code: Option<&str>) -> Config {
        Config {
            client_id: "client".to_owned(),
            client_secret: "shh".to_owned(),
            cache: Some(cache.to_owned()),
            code: code.map(String::from),
        }
    }

    fn token(expires_at: Option<i64>) -> CachedToken {
        CachedToken {
            kind: "authorized_user".to_owned(),
            client_id: "client".to_owned(),
            client_secret: "shh".to_owned(),
            refresh_token: "refresh".to_owned(),
            access_token: Some("access".to_owned()),
            expires_at,
        }
    }

    /// Answers a single HTTP request with the response, the received request
    /// is returned when joining the handle
    fn respond_once(status: &str, body: &str) -> (String, std::thread::JoinHandle<String>) {
        use std::io::{BufRead, BufReader, Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\n\
             content-type: application/json\r\n\
             content-length: {}\r\n\
             connection: close\r\n\r\n{body}",
            body.len()
        );

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);

            let mut request = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }

                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }

                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }

            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            request.push_str(&String::from_utf8(body).unwrap());

            let mut stream = reader.into_inner();
            stream.write_all(response.as_bytes()).unwrap();
            request
        });

        (url, handle)
    }

    /// Proxies configured in the environment must not intercept local requests
    fn local_client() -> Client {
        Client::builder().no_proxy().build().unwrap()
    }

    fn local_authenticator(
        path: &Utf8Path,
        code: Option<&str>,
        token_url: String,
    ) -> Authenticator {
        let mut auth = Authenticator::new(config(path, code), TokenCache::new(path.to_owned()))
            .unwrap()
            .with_token_url(token_url);
        auth.client = local_client();
        auth
    }

    fn temp_cache() -> (tempfile::TempDir, PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = PathBuf::from_path_buf(td.path().join("cache.json")).unwrap();
        (td, path)
    }

    #[test]
    fn missing_or_empty_cache_has_no_token() {
        let (_td, path) = temp_cache();
        let cache = TokenCache::new(path.clone());
        assert!(cache.load().unwrap().is_none());

        std::fs::write(&path, b"").unwrap();
        assert!(cache.load().unwrap().is_none());

        std::fs::write(&path, b"  \n").unwrap();
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn invalid_cache_is_ignored() {
        let (_td, path) = temp_cache();
        std::fs::write(&path, b"{\"access_token\": 12").unwrap();
        assert!(TokenCache::new(path).load().unwrap().is_none());
    }

    #[test]
    fn stored_token_is_loaded() {
        let (_td, path) = temp_cache();
        let cache = TokenCache::new(path.clone());

        std::fs::write(&path, b"stale").unwrap();
        let tok = token(Some(1_000));
        cache.store(&tok).unwrap();
        assert_eq!(cache.load().unwrap(), Some(tok));

        // The cache is a usable authorized_user credential file
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["type"], "authorized_user");
        assert_eq!(json["refresh_token"], "refresh");
    }

    #[test]
    fn access_token_expiry() {
        let tok = token(Some(1_000));
        assert_eq!(tok.valid_access_token(0), Some("access"));
        assert_eq!(tok.valid_access_token(1_000 - EXPIRY_MARGIN), None);
        assert_eq!(tok.valid_access_token(2_000), None);
        assert_eq!(token(None).valid_access_token(0), None);
    }

    #[test]
    fn authorization_url_params() {
        let (_td, path) = temp_cache();
        let url = authorization_url(&config(&path, None)).unwrap();

        assert!(url.as_str().starts_with(AUTH_URL));

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client");
        assert_eq!(pairs["redirect_uri"], REDIRECT_URL);
        assert_eq!(pairs["scope"], SCOPE);
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["access_type"], "offline");
    }

    #[test]
    fn requires_authorization_without_token_or_code() {
        let (_td, path) = temp_cache();
        std::fs::write(&path, b"").unwrap();

        let mut auth =
            Authenticator::new(config(&path, None), TokenCache::new(path.clone())).unwrap();

        match auth.authenticate().unwrap() {
            Authorization::Required(url) => assert!(url.as_str().starts_with(AUTH_URL)),
            Authorization::Authorized(_) => panic!("should not be authorized"),
        }
        assert!(!auth.is_authenticated());

        let err = auth.session().err().unwrap();
        assert!(err.downcast_ref::<AuthorizationRequired>().is_some());

        // Nothing was written to the cache
        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn valid_cached_token_authenticates_once() {
        let (_td, path) = temp_cache();
        let cache = TokenCache::new(path.clone());
        cache.store(&token(Some(now() + 3600))).unwrap();

        let mut auth = Authenticator::new(config(&path, None), cache).unwrap();
        assert!(matches!(
            auth.authenticate().unwrap(),
            Authorization::Authorized(_)
        ));
        assert!(auth.is_authenticated());

        // The session is memoized, the cache isn't consulted again
        std::fs::remove_file(&path).unwrap();
        assert!(auth.session().is_ok());
    }

    #[test]
    fn token_for_other_client_is_ignored() {
        let (_td, path) = temp_cache();
        let cache = TokenCache::new(path.clone());
        let mut tok = token(Some(now() + 3600));
        tok.client_id = "someone-else".to_owned();
        cache.store(&tok).unwrap();

        let mut auth = Authenticator::new(config(&path, None), cache).unwrap();
        assert!(matches!(
            auth.authenticate().unwrap(),
            Authorization::Required(_)
        ));
    }

    #[test]
    fn exchange_reports_error_body() {
        let (_td, path) = temp_cache();
        let (url, server) = respond_once("400 Bad Request", r#"{"error": "invalid_grant"}"#);

        let err = exchange_code(&local_client(), &url, &config(&path, None), "code").unwrap_err();
        server.join().unwrap();

        let msg = format!("{err:#}");
        assert!(msg.contains("authorization code exchange failed"), "{msg}");
        assert!(msg.contains("invalid_grant"), "{msg}");
    }

    #[test]
    fn exchange_requires_refresh_token() {
        let (_td, path) = temp_cache();
        let (url, server) = respond_once("200 OK", r#"{"access_token": "a", "expires_in": 3600}"#);

        let err = exchange_code(&local_client(), &url, &config(&path, None), "code").unwrap_err();
        server.join().unwrap();

        assert!(format!("{err:#}").contains("did not contain a refresh token"));
    }

    #[test]
    fn exchange_sends_code() {
        let (_td, path) = temp_cache();
        let (url, server) = respond_once(
            "200 OK",
            r#"{"access_token": "a", "expires_in": 3600, "refresh_token": "r"}"#,
        );

        let tok = exchange_code(&local_client(), &url, &config(&path, None), "the-code").unwrap();
        let request = server.join().unwrap();

        assert!(request.starts_with("POST /token"));
        assert!(request.contains("grant_type=authorization_code"));
        assert!(request.contains("code=the-code"));
        assert_eq!(tok.refresh_token, "r");
        assert_eq!(tok.access_token.as_deref(), Some("a"));
        assert!(tok.valid_access_token(now()).is_some());
    }

    #[test]
    fn code_exchange_authenticates_and_caches() {
        let (_td, path) = temp_cache();
        let (url, server) = respond_once(
            "200 OK",
            r#"{"access_token": "a", "expires_in": 3600, "refresh_token": "r"}"#,
        );

        let mut auth = local_authenticator(&path, Some("the-code"), url);
        assert!(auth.session().is_ok());
        server.join().unwrap();

        let cached = TokenCache::new(path.clone()).load().unwrap().unwrap();
        assert_eq!(cached.refresh_token, "r");
        assert_eq!(cached.client_id, "client");
    }

    #[test]
    fn expired_token_is_refreshed() {
        let (_td, path) = temp_cache();
        TokenCache::new(path.clone())
            .store(&token(Some(now() - 10)))
            .unwrap();

        let (url, server) =
            respond_once("200 OK", r#"{"access_token": "fresh", "expires_in": 3600}"#);

        let mut auth = local_authenticator(&path, None, url);
        assert!(matches!(
            auth.authenticate().unwrap(),
            Authorization::Authorized(_)
        ));

        let request = server.join().unwrap();
        assert!(request.contains("grant_type=refresh_token"));
        assert!(request.contains("refresh_token=refresh"));

        // The refresh token is kept when the server doesn't rotate it
        let cached = TokenCache::new(path.clone()).load().unwrap().unwrap();
        assert_eq!(cached.access_token.as_deref(), Some("fresh"));
        assert_eq!(cached.refresh_token, "refresh");
    }

    #[test]
    fn failed_refresh_requires_authorization() {
        let (_td, path) = temp_cache();
        TokenCache::new(path.clone())
            .store(&token(Some(now() - 10)))
            .unwrap();

        let (url, server) = respond_once("400 Bad Request", r#"{"error": "invalid_grant"}"#);

        let mut auth = local_authenticator(&path, None, url);
        assert!(matches!(
            auth.authenticate().unwrap(),
            Authorization::Required(_)
        ));
        server.join().unwrap();
        assert!(!auth.is_authenticated());
    }

    #[cfg(unix)]
    #[test]
    fn cache_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_td, path) = temp_cache();
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        TokenCache::new(path.clone()).store(&token(None)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
