//! HTTP backend: the Reddit proxy endpoints and the local media listing.
//!
//! Routing is a pure function from [`ApiRequest`] to [`Reply`] so it can be
//! exercised without sockets; [`Backend`] only moves bytes between
//! `tiny_http` and [`handle`].

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use tiny_http::{Header, Response, Server};
use tracing::{info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::library::{self, Library};
use crate::reddit::Upstream;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ApiRequest {
    /// Builds a request from a method and a path with optional query string.
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_ascii_uppercase(),
            path,
            query,
            ..Self::default()
        }
    }

    pub fn with_bearer(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {token}"));
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.content_type = Some("application/json".into());
        self.body = body.to_string().into_bytes();
        self
    }

    pub fn with_form(mut self, body: &str) -> Self {
        self.content_type = Some("application/x-www-form-urlencoded".into());
        self.body = body.as_bytes().to_vec();
        self
    }

    fn bearer(&self) -> Option<&str> {
        let value = self.authorization.as_deref()?.trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))?
            .trim();
        (!token.is_empty()).then_some(token)
    }
}

#[derive(Debug)]
pub enum Body {
    Json(Value),
    File {
        path: PathBuf,
        content_type: &'static str,
    },
    Empty,
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub body: Body,
}

impl Reply {
    fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            body: Body::Json(value),
        }
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// What the backend can serve. Either source may be absent.
pub struct State {
    upstream: Option<Arc<dyn Upstream>>,
    library: Option<Arc<Library>>,
    page_size: usize,
}

impl State {
    pub fn new(
        upstream: Option<Arc<dyn Upstream>>,
        library: Option<Arc<Library>>,
        page_size: usize,
    ) -> Self {
        Self {
            upstream,
            library,
            page_size: page_size.max(1),
        }
    }
}

pub fn handle(state: &State, req: &ApiRequest) -> Reply {
    if req.method == "OPTIONS" {
        return Reply {
            status: 204,
            body: Body::Empty,
        };
    }

    let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
    match (req.method.as_str(), segments.as_slice()) {
        ("POST", ["api", "token"]) => exchange_token(state, req),
        ("GET", ["api", "me"]) => me(state, req),
        ("GET", ["api", "saved", username]) => saved(state, req, username),
        ("GET", ["api", "media"]) => media_page(state, req),
        ("GET", ["api", "media", "file", id]) => media_file(state, id),
        ("GET", ["status"]) => status(state),
        _ => Reply::json(404, json!({ "error": "Not found" })),
    }
}

fn exchange_token(state: &State, req: &ApiRequest) -> Reply {
    const LABEL: &str = "Token exchange failed";

    let params = match token_params(req) {
        Ok(params) => params,
        Err(message) => {
            return Reply::json(400, json!({ "error": LABEL, "details": { "message": message } }))
        }
    };
    let code = params.get("code").map(String::as_str).unwrap_or_default();
    let redirect_uri = params
        .get("redirect_uri")
        .map(String::as_str)
        .unwrap_or_default();
    if code.is_empty() || redirect_uri.is_empty() {
        return Reply::json(
            400,
            json!({ "error": LABEL, "details": { "message": "code and redirect_uri are required" } }),
        );
    }

    let Some(upstream) = state.upstream.as_ref().filter(|u| u.has_credentials()) else {
        warn!("token exchange requested without reddit credentials");
        return Reply::json(
            500,
            json!({
                "error": "Server configuration error",
                "details": { "message": "Reddit client credentials are not configured" }
            }),
        );
    };

    info!(code = %redact(code), "exchanging authorization code");
    match upstream.exchange_code(code, redirect_uri) {
        Ok(payload) => Reply::json(200, token_body(&payload)),
        Err(err) => error_reply(LABEL, err),
    }
}

fn token_params(req: &ApiRequest) -> std::result::Result<HashMap<String, String>, String> {
    let is_form = req
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("application/x-www-form-urlencoded"));
    if is_form {
        return Ok(url::form_urlencoded::parse(&req.body).into_owned().collect());
    }
    if req.body.is_empty() {
        return Ok(HashMap::new());
    }
    let value: Value =
        serde_json::from_slice(&req.body).map_err(|err| format!("invalid JSON body: {err}"))?;
    let Value::Object(map) = value else {
        return Err("body must be a JSON object".into());
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect())
}

fn token_body(payload: &Value) -> Value {
    let mut body = json!({ "access_token": payload["access_token"] });
    if let Some(refresh) = payload.get("refresh_token").filter(|v| !v.is_null()) {
        body["refresh_token"] = refresh.clone();
    }
    body
}

fn me(state: &State, req: &ApiRequest) -> Reply {
    let Some(token) = req.bearer() else {
        return Reply::json(401, json!({ "error": "No token provided" }));
    };
    let Some(upstream) = state.upstream.as_ref() else {
        return not_configured("Reddit");
    };
    match upstream.me(token) {
        Ok(profile) => Reply::json(200, profile),
        Err(err) => error_reply("Failed to fetch user data", err),
    }
}

fn saved(state: &State, req: &ApiRequest, username: &str) -> Reply {
    let Some(token) = req.bearer() else {
        return Reply::json(401, json!({ "error": "No token provided" }));
    };
    let Some(upstream) = state.upstream.as_ref() else {
        return not_configured("Reddit");
    };
    let username = percent_decode_str(username).decode_utf8_lossy();
    let after = req.query.get("after").map(String::as_str);
    match upstream.saved(token, &username, after) {
        Ok(listing) => Reply::json(200, listing),
        Err(err) => error_reply("Failed to fetch saved posts", err),
    }
}

fn media_page(state: &State, req: &ApiRequest) -> Reply {
    let Some(library) = state.library.as_ref() else {
        return not_configured("Media library");
    };
    let page = match positive_param(req, "page", 1) {
        Ok(page) => page,
        Err(reply) => return reply,
    };
    let limit = match positive_param(req, "limit", state.page_size) {
        Ok(limit) => limit,
        Err(reply) => return reply,
    };
    match library.page(page, limit) {
        Ok(listing) => {
            let children: Vec<Value> = listing
                .records
                .iter()
                .map(|post| json!({ "kind": "t3", "data": post }))
                .collect();
            let after = listing.has_more.then_some("more");
            Reply::json(
                200,
                json!({
                    "kind": "Listing",
                    "data": { "children": children, "after": after, "dist": listing.total }
                }),
            )
        }
        Err(err) => error_reply("Failed to list media", err),
    }
}

fn positive_param(
    req: &ApiRequest,
    key: &str,
    default: usize,
) -> std::result::Result<usize, Reply> {
    match req.query.get(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(Reply::json(
                400,
                json!({ "error": format!("{key} must be a positive integer") }),
            )),
        },
    }
}

fn media_file(state: &State, id: &str) -> Reply {
    let Some(library) = state.library.as_ref() else {
        return not_configured("Media library");
    };
    match library.resolve(id) {
        Ok(path) => Reply {
            status: 200,
            body: Body::File {
                content_type: library::content_type(&path),
                path,
            },
        },
        Err(err) => error_reply("Media not found", err),
    }
}

fn status(state: &State) -> Reply {
    Reply::json(
        200,
        json!({
            "status": "Server is running",
            "timestamp": Utc::now().to_rfc3339(),
            "version": crate::VERSION,
            "sources": {
                "reddit": state.upstream.as_ref().is_some_and(|u| u.has_credentials()),
                "library": state.library.is_some(),
            }
        }),
    )
}

fn not_configured(what: &str) -> Reply {
    Reply::json(404, json!({ "error": format!("{what} is not configured") }))
}

/// Maps an error onto the backend's `{error, details}` envelope, forwarding
/// the provider status where there is one.
fn error_reply(label: &str, err: Error) -> Reply {
    let status = err.status_code();
    let error = match &err {
        Error::Configuration(_) => "Server configuration error",
        _ => label,
    };
    let details = match err {
        Error::Upstream {
            message, details, ..
        } => {
            if details.is_null() {
                json!({ "message": message })
            } else {
                details
            }
        }
        Error::Network(_) => json!({ "message": "No response from Reddit" }),
        other => json!({ "message": other.to_string() }),
    };
    Reply::json(status, json!({ "error": error, "details": details }))
}

fn redact(code: &str) -> String {
    let prefix: String = code.chars().take(4).collect();
    format!("{prefix}…")
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    match Url::parse(&format!("http://localhost{target}")) {
        Ok(url) => (
            url.path().to_string(),
            url.query_pairs().into_owned().collect(),
        ),
        Err(_) => (target.to_string(), HashMap::new()),
    }
}

pub struct Backend {
    server: Arc<Server>,
    state: Arc<State>,
    workers: usize,
}

impl Backend {
    pub fn bind(addr: &str, state: State, workers: usize) -> Result<Self> {
        let server = Server::http(addr)
            .map_err(|err| Error::Configuration(format!("listen on {addr}: {err}")))?;
        Ok(Self {
            server: Arc::new(server),
            state: Arc::new(state),
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> String {
        self.server
            .server_addr()
            .to_ip()
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Serves requests on `workers` threads until the process exits.
    pub fn run(self) {
        info!(addr = %self.local_addr(), workers = self.workers, "backend listening");
        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let server = self.server.clone();
                let state = self.state.clone();
                thread::spawn(move || {
                    for request in server.incoming_requests() {
                        serve_one(&state, request);
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn serve_one(state: &State, mut request: tiny_http::Request) {
    let mut api = ApiRequest::new(request.method().as_str(), request.url());
    for header in request.headers() {
        if header.field.equiv("Authorization") {
            api.authorization = Some(header.value.to_string());
        } else if header.field.equiv("Content-Type") {
            api.content_type = Some(header.value.to_string());
        }
    }
    let reply = match read_body(request.as_reader(), MAX_BODY_BYTES) {
        Ok(Some(body)) => {
            api.body = body;
            handle(state, &api)
        }
        Ok(None) => Reply::json(
            413,
            json!({ "error": format!("Request body exceeds {MAX_BODY_BYTES} bytes") }),
        ),
        Err(err) => {
            warn!("failed to read request body: {err}");
            Reply::json(400, json!({ "error": "Unreadable request body" }))
        }
    };
    info!(method = %api.method, path = %api.path, status = reply.status, "request");

    let outcome = match reply.body {
        Body::Json(value) => request.respond(with_cors(
            Response::from_string(value.to_string())
                .with_status_code(reply.status)
                .with_header(header("Content-Type", "application/json")),
        )),
        Body::File { path, content_type } => match File::open(&path) {
            Ok(file) => request.respond(with_cors(
                Response::from_file(file).with_header(header("Content-Type", content_type)),
            )),
            Err(err) => {
                warn!(path = %path.display(), "failed to open media file: {err}");
                request.respond(with_cors(
                    Response::from_string(json!({ "error": "Media not found" }).to_string())
                        .with_status_code(404)
                        .with_header(header("Content-Type", "application/json")),
                ))
            }
        },
        Body::Empty => request.respond(with_cors(
            Response::empty(reply.status)
                .with_header(header("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
                .with_header(header(
                    "Access-Control-Allow-Headers",
                    "Authorization, Content-Type",
                )),
        )),
    };
    if let Err(err) = outcome {
        warn!("failed to write response: {err}");
    }
}

/// Reads at most `limit` bytes. `None` means the body was longer.
fn read_body<R: Read>(reader: R, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit + 1).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(body))
}

fn with_cors<R: Read>(response: Response<R>) -> Response<R> {
    response.with_header(header("Access-Control-Allow-Origin", "*"))
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}
