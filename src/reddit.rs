use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, USER_AGENT};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com/";
pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// The provider calls the backend proxies. Bodies stay as raw JSON so they
/// can be forwarded untouched.
pub trait Upstream: Send + Sync {
    fn has_credentials(&self) -> bool;

    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value>;

    fn me(&self, token: &str) -> Result<Value>;

    fn saved(&self, token: &str, username: &str, after: Option<&str>) -> Result<Value>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub client_id: String,
    pub client_secret: String,
    pub base_url: Option<String>,
    pub token_url: Option<String>,
    pub page_limit: Option<u32>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: String,
    page_limit: u32,
    rate: RwLock<RateLimit>,
}

/// Last rate-limit window the provider reported.
#[derive(Debug, Clone, Default)]
struct RateLimit {
    used: f64,
    remaining: f64,
    reset_at: Option<SystemTime>,
}

impl RateLimit {
    /// Seconds until the window resets, if the quota is spent.
    fn wait(&self, now: SystemTime) -> Option<u64> {
        if self.remaining > 0.0 || self.used == 0.0 {
            return None;
        }
        let reset_at = self.reset_at?;
        reset_at
            .duration_since(now)
            .ok()
            .map(|left| left.as_secs().max(1))
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            return Err(Error::Configuration(
                "reddit client user agent required".into(),
            ));
        }
        let base_url = parse_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let token_url = parse_url(config.token_url.as_deref().unwrap_or(DEFAULT_TOKEN_URL))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .map_err(|err| Error::Configuration(format!("reddit: build http client: {err}")))?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            token_url,
            client_id: config.client_id.trim().to_string(),
            client_secret: config.client_secret.trim().to_string(),
            page_limit: config.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            rate: RwLock::new(RateLimit::default()),
        })
    }

    fn get(&self, token: &str, path: &str, params: &[(&str, &str)]) -> Result<Value> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| Error::InvalidRequest(format!("bad path {path}: {err}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        if let Some(wait) = self.rate.read().wait(SystemTime::now()) {
            warn!(wait_secs = wait, "reddit quota spent, not sending request");
            return Err(Error::Upstream {
                status: 429,
                message: "rate limited".into(),
                details: json!({ "message": "Reddit rate limit reached", "retry_after": wait }),
            });
        }

        debug!(%url, "reddit request");
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .bearer_auth(token)
            .send()?;
        self.capture_rate(resp.headers());
        read_json(resp)
    }

    fn capture_rate(&self, headers: &HeaderMap) {
        let remaining = header_float(headers, "x-ratelimit-remaining");
        let used = header_float(headers, "x-ratelimit-used");
        let reset = header_float(headers, "x-ratelimit-reset");
        if remaining == 0.0 && used == 0.0 && reset == 0.0 {
            return;
        }
        let reset_at = SystemTime::now().checked_add(Duration::from_secs_f64(reset.max(0.0)));
        let mut rate = self.rate.write();
        rate.remaining = remaining;
        rate.used = used;
        rate.reset_at = reset_at;
    }
}

impl Upstream for Client {
    fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Value> {
        if !self.has_credentials() {
            return Err(Error::Configuration(
                "reddit client id and secret are not configured".into(),
            ));
        }
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let resp = self
            .http
            .post(self.token_url.clone())
            .header(USER_AGENT, self.user_agent.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()?;
        let payload = read_json(resp)?;

        // The token endpoint reports some failures as 200 with an error body.
        if payload.get("access_token").and_then(Value::as_str).is_none() {
            let message = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("missing access token")
                .to_string();
            return Err(Error::Upstream {
                status: 400,
                message,
                details: payload,
            });
        }
        Ok(payload)
    }

    fn me(&self, token: &str) -> Result<Value> {
        self.get(token, "/api/v1/me", &[])
    }

    fn saved(&self, token: &str, username: &str, after: Option<&str>) -> Result<Value> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::InvalidRequest("username is required".into()));
        }
        let path = format!(
            "/user/{}/saved",
            utf8_percent_encode(username, NON_ALPHANUMERIC)
        );
        let limit = self.page_limit.to_string();
        let mut params = vec![("limit", limit.as_str()), ("raw_json", "1")];
        if let Some(after) = after.filter(|a| !a.is_empty()) {
            params.push(("after", after));
        }
        self.get(token, &path, &params)
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| Error::Configuration(format!("invalid url {raw}: {err}")))
}

/// Successful bodies decode as JSON; failures keep the provider status and
/// body so they can be forwarded.
fn read_json(resp: Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.text()?;
    if status.is_success() {
        return serde_json::from_str(&body).map_err(|err| Error::Upstream {
            status: 502,
            message: format!("malformed response: {err}"),
            details: Value::Null,
        });
    }
    let details = serde_json::from_str(&body).unwrap_or(Value::String(body));
    let message = match status.as_u16() {
        401 => "unauthorized".to_string(),
        403 => "forbidden".to_string(),
        429 => "rate limited".to_string(),
        _ => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_ascii_lowercase(),
    };
    Err(Error::Upstream {
        status: status.as_u16(),
        message,
        details,
    })
}

fn header_float(headers: &HeaderMap, key: &str) -> f64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::io::Read;
    use std::thread;
    use tiny_http::{Header, Response as HttpResponse, Server};

    struct Seen {
        url: String,
        authorization: Option<String>,
        body: String,
    }

    fn serve_once(
        status: u16,
        body: &'static str,
        headers: Vec<(&'static str, &'static str)>,
    ) -> (String, Receiver<Seen>) {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = format!("http://{}/", server.server_addr().to_ip().unwrap());
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            if let Ok(mut request) = server.recv() {
                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.to_string());
                let mut body_in = String::new();
                let _ = request.as_reader().read_to_string(&mut body_in);
                let _ = tx.send(Seen {
                    url: request.url().to_string(),
                    authorization,
                    body: body_in,
                });
                let mut response = HttpResponse::from_string(body).with_status_code(status);
                for (k, v) in headers {
                    response.add_header(Header::from_bytes(k.as_bytes(), v.as_bytes()).unwrap());
                }
                let _ = request.respond(response);
            }
        });
        (addr, rx)
    }

    fn client(base: &str, secret: &str) -> Client {
        Client::new(ClientConfig {
            user_agent: "test-agent".into(),
            client_id: "id".into(),
            client_secret: secret.into(),
            base_url: Some(base.into()),
            token_url: Some(format!("{base}api/v1/access_token")),
            page_limit: None,
            http_client: None,
        })
        .unwrap()
    }

    #[test]
    fn saved_sends_limit_cursor_and_bearer() {
        let (base, seen) = serve_once(
            200,
            r#"{"kind":"Listing","data":{"after":null,"children":[]}}"#,
            vec![("x-ratelimit-remaining", "99"), ("x-ratelimit-used", "1")],
        );
        let client = client(&base, "secret");
        let payload = client.saved("tok", "some user", Some("t3_abc")).unwrap();
        assert_eq!(payload["kind"], "Listing");

        let seen = seen.recv().unwrap();
        assert!(seen.url.starts_with("/user/some%20user/saved?"));
        assert!(seen.url.contains("limit=50"));
        assert!(seen.url.contains("after=t3_abc"));
        assert_eq!(seen.authorization.as_deref(), Some("Bearer tok"));
        assert_eq!(client.rate.read().remaining, 99.0);
    }

    #[test]
    fn spent_quota_short_circuits_until_reset() {
        let (base, _seen) = serve_once(
            200,
            r#"{"name":"spez"}"#,
            vec![
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-used", "600"),
                ("x-ratelimit-reset", "120"),
            ],
        );
        let client = client(&base, "secret");
        assert_eq!(client.me("tok").unwrap()["name"], "spez");

        match client.me("tok").unwrap_err() {
            Error::Upstream {
                status, details, ..
            } => {
                assert_eq!(status, 429);
                assert!(details["retry_after"].as_u64().unwrap() > 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn provider_failure_keeps_status_and_body() {
        let (base, _seen) = serve_once(403, r#"{"message":"Forbidden","error":403}"#, vec![]);
        let err = client(&base, "secret").me("tok").unwrap_err();
        match err {
            Error::Upstream {
                status, details, ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(details["message"], "Forbidden");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn exchange_uses_basic_auth_and_form() {
        let (base, seen) = serve_once(
            200,
            r#"{"access_token":"a","refresh_token":"r","token_type":"bearer"}"#,
            vec![],
        );
        let payload = client(&base, "secret")
            .exchange_code("the-code", "http://localhost:3000/auth-callback")
            .unwrap();
        assert_eq!(payload["refresh_token"], "r");

        let seen = seen.recv().unwrap();
        assert!(seen
            .authorization
            .as_deref()
            .unwrap_or_default()
            .starts_with("Basic "));
        assert!(seen.body.contains("grant_type=authorization_code"));
        assert!(seen.body.contains("code=the-code"));
    }

    #[test]
    fn exchange_error_body_on_success_status() {
        let (base, _seen) = serve_once(200, r#"{"error":"invalid_grant"}"#, vec![]);
        let err = client(&base, "secret")
            .exchange_code("stale", "http://localhost/cb")
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 400, .. }));
    }

    #[test]
    fn exchange_without_secret_is_configuration_error() {
        let client = client("http://127.0.0.1:9/", "");
        assert!(!client.has_credentials());
        assert!(matches!(
            client.exchange_code("code", "http://localhost/cb"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn unreachable_provider_is_network_error() {
        let client = client("http://127.0.0.1:9/", "secret");
        assert!(matches!(client.me("tok"), Err(Error::Network(_))));
    }
}
