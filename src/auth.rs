use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use tiny_http::{Header, Response, Server};
use tracing::{info, warn};
use url::Url;

use crate::api::{BackendClient, Identity};
use crate::error::{Error, Result};
use crate::storage::{KeyValueStore, AUTH_STATE_KEY, REFRESH_TOKEN_KEY, TOKEN_KEY};

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>Saved Gallery</title>
    <style>
      body { font-family: sans-serif; display: flex; min-height: 100vh; align-items: center; justify-content: center; }
      main { max-width: 420px; text-align: center; }
    </style>
  </head>
  <body>
    <main>
      <h1>Signed in</h1>
      <p>Saved Gallery is connected to your Reddit account. You can close this tab.</p>
    </main>
  </body>
</html>"#;

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub redirect_uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            scopes: vec!["history".into(), "identity".into(), "save".into()],
            auth_url: "https://www.reddit.com/api/v1/authorize".into(),
            redirect_uri: "http://localhost:3000/auth-callback".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub refresh_token: Option<String>,
    pub identity: Identity,
}

impl Session {
    pub fn username(&self) -> &str {
        &self.identity.name
    }
}

pub struct Flow {
    cfg: Config,
    store: Arc<dyn KeyValueStore>,
    backend: Arc<BackendClient>,
    pending_state: Mutex<Option<String>>,
}

impl Flow {
    pub fn new(cfg: Config, store: Arc<dyn KeyValueStore>, backend: Arc<BackendClient>) -> Self {
        Self {
            cfg,
            store,
            backend,
            pending_state: Mutex::new(None),
        }
    }

    /// Starts a login: mints and remembers a state nonce and returns the
    /// provider URL the browser should open.
    pub fn begin(&self) -> Result<String> {
        if self.cfg.client_id.trim().is_empty() {
            return Err(Error::Configuration("reddit client id is required".into()));
        }
        let state = random_string(24);
        if let Err(err) = self.store.set(AUTH_STATE_KEY, &state) {
            warn!("auth state kept in memory only: {err:#}");
        }
        *self.pending_state.lock() = Some(state.clone());
        self.authorize_url(&state)
    }

    fn authorize_url(&self, state: &str) -> Result<String> {
        let mut auth = Url::parse(&self.cfg.auth_url)
            .map_err(|err| Error::Configuration(format!("invalid authorize url: {err}")))?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", &self.cfg.redirect_uri)
            .append_pair("duration", "permanent")
            .append_pair("scope", &self.cfg.scopes.join(" "));
        Ok(auth.to_string())
    }

    /// Verifies the redirect parameters and exchanges the code through the
    /// backend.
    pub fn complete(&self, params: &HashMap<String, String>) -> Result<Session> {
        if let Some(error) = params.get("error") {
            self.forget_state();
            return Err(Error::Auth(format!("authorization denied: {error}")));
        }

        let expected = self.expected_state();
        let received = params.get("state").map(String::as_str);
        match (expected.as_deref(), received) {
            (Some(expected), Some(received)) if expected == received => {}
            _ => {
                self.forget_state();
                return Err(Error::Auth("authorization state mismatch".into()));
            }
        }

        let code = match params.get("code") {
            Some(code) if !code.is_empty() => code,
            _ => {
                self.forget_state();
                return Err(Error::Auth("authorization code missing".into()));
            }
        };

        let grant = self.backend.exchange_token(code, &self.cfg.redirect_uri)?;
        self.put(TOKEN_KEY, &grant.access_token);
        if let Some(refresh) = grant.refresh_token.as_deref() {
            self.put(REFRESH_TOKEN_KEY, refresh);
        }
        self.forget_state();

        let identity = self.backend.me(&grant.access_token)?;
        info!(user = %identity.name, "signed in");
        Ok(Session {
            token: grant.access_token,
            refresh_token: grant.refresh_token,
            identity,
        })
    }

    /// Restores the stored session, if any. A token the provider no longer
    /// accepts is cleared and reported as an auth error.
    pub fn resume(&self) -> Result<Option<Session>> {
        let token = match self.store.get(TOKEN_KEY) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return Ok(None),
            Err(err) => {
                warn!("could not read stored token: {err:#}");
                return Ok(None);
            }
        };
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY).ok().flatten();
        match self.backend.me(&token) {
            Ok(identity) => Ok(Some(Session {
                token,
                refresh_token,
                identity,
            })),
            Err(err @ Error::Auth(_)) => {
                self.logout();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn logout(&self) {
        clear_tokens(self.store.as_ref());
        *self.pending_state.lock() = None;
    }

    /// Full interactive login: listen on the redirect address, send the user
    /// to the provider, and finish with whatever comes back.
    pub fn login(&self, open_browser: bool, timeout: Duration) -> Result<Session> {
        let listener = CallbackListener::bind(&self.cfg.redirect_uri)?;
        let url = self.begin()?;
        if open_browser {
            if let Err(err) = webbrowser::open(&url) {
                warn!("could not open browser: {err}");
            }
        }
        println!("Open this URL to sign in:\n{url}");
        let params = listener.wait(timeout)?;
        self.complete(&params)
    }

    fn expected_state(&self) -> Option<String> {
        if let Some(state) = self.pending_state.lock().clone() {
            return Some(state);
        }
        match self.store.get(AUTH_STATE_KEY) {
            Ok(state) => state,
            Err(err) => {
                warn!("could not read auth state: {err:#}");
                None
            }
        }
    }

    fn forget_state(&self) {
        *self.pending_state.lock() = None;
        if let Err(err) = self.store.remove(AUTH_STATE_KEY) {
            warn!("could not clear auth state: {err:#}");
        }
    }

    fn put(&self, key: &str, value: &str) {
        if let Err(err) = self.store.set(key, value) {
            warn!("{key} kept in memory only: {err:#}");
        }
    }
}

/// One-shot HTTP listener on the redirect URI's host and port.
pub struct CallbackListener {
    server: Server,
    path: String,
}

impl CallbackListener {
    pub fn bind(redirect_uri: &str) -> Result<Self> {
        let redirect = Url::parse(redirect_uri)
            .map_err(|err| Error::Configuration(format!("invalid redirect uri: {err}")))?;
        let host = redirect.host_str().unwrap_or("127.0.0.1");
        let port = redirect.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");
        let server = Server::http(&addr)
            .map_err(|err| Error::Configuration(format!("auth: listen on {addr}: {err}")))?;
        let path = if redirect.path().is_empty() {
            "/".to_string()
        } else {
            redirect.path().to_string()
        };
        Ok(Self { server, path })
    }

    pub fn local_addr(&self) -> String {
        self.server
            .server_addr()
            .to_ip()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Waits for the redirect and returns its query parameters. Requests for
    /// other paths are answered with 404 and ignored.
    pub fn wait(&self, timeout: Duration) -> Result<HashMap<String, String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Auth("timed out waiting for authorization".into()));
            }
            let request = match self.server.recv_timeout(remaining) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => return Err(Error::Auth(format!("auth: wait error: {err}"))),
            };
            let url = match Url::parse(&format!("http://localhost{}", request.url())) {
                Ok(url) => url,
                Err(_) => {
                    let _ = request.respond(Response::from_string("bad request").with_status_code(400));
                    continue;
                }
            };
            if url.path() != self.path {
                let _ = request.respond(Response::from_string("not found").with_status_code(404));
                continue;
            }
            let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let response = Response::from_string(HTML_SUCCESS).with_header(
                Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
                    .expect("valid header"),
            );
            let _ = request.respond(response);
            return Ok(params);
        }
    }
}

/// Forgets every credential this client stored.
pub fn clear_tokens(store: &dyn KeyValueStore) {
    for key in [TOKEN_KEY, REFRESH_TOKEN_KEY, AUTH_STATE_KEY] {
        if let Err(err) = store.remove(key) {
            warn!("could not clear {key}: {err:#}");
        }
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
