//! Blocking client for the backend, and the page sources built on it.

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::error::{Error, Result};
use crate::model::{Listing, ListingEnvelope, Post};
use crate::paginator::{Page, PageSource};

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

pub struct BackendClient {
    http: HttpClient,
    base: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut raw = base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|err| Error::Configuration(format!("invalid backend url {raw}: {err}")))?;
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| Error::Configuration(format!("build http client: {err}")))?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn exchange_token(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        let req = self
            .http
            .post(self.url("api/token")?)
            .json(&json!({ "code": code, "redirect_uri": redirect_uri }));
        send(req)
    }

    pub fn me(&self, token: &str) -> Result<Identity> {
        send(self.http.get(self.url("api/me")?).bearer_auth(token))
    }

    pub fn saved(&self, token: &str, username: &str, after: Option<&str>) -> Result<Listing<Post>> {
        let mut url = self.url(&format!(
            "api/saved/{}",
            utf8_percent_encode(username, NON_ALPHANUMERIC)
        ))?;
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", after);
        }
        let envelope: ListingEnvelope<Post> = send(self.http.get(url).bearer_auth(token))?;
        Ok(envelope.data)
    }

    pub fn media(&self, page: usize, limit: usize) -> Result<Listing<Post>> {
        let mut url = self.url("api/media")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());
        let envelope: ListingEnvelope<Post> = send(self.http.get(url))?;
        Ok(envelope.data)
    }

    pub fn status(&self) -> Result<Value> {
        send(self.http.get(self.url("status")?))
    }

    /// Resolves a backend-relative path such as a library file url.
    pub fn absolute(&self, path: &str) -> String {
        if !path.starts_with('/') {
            return path.to_string();
        }
        self.base
            .join(path.trim_start_matches('/'))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| Error::InvalidRequest(format!("bad path {path}: {err}")))
    }
}

fn send<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
    let resp = req.send()?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json()?);
    }
    let body: Value = resp.json().unwrap_or(Value::Null);
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed"))
        .to_string();
    if status.as_u16() == 401 {
        return Err(Error::Auth(message));
    }
    Err(Error::Upstream {
        status: status.as_u16(),
        message,
        details: body.get("details").cloned().unwrap_or(Value::Null),
    })
}

fn page_from_listing(listing: Listing<Post>) -> Page {
    let raw_count = listing.children.len();
    Page {
        records: listing.children.into_iter().map(|thing| thing.data).collect(),
        next_cursor: listing.after,
        raw_count,
    }
}

/// The signed-in user's saved posts, paged by the provider's `after` cursor.
pub struct SavedSource {
    client: Arc<BackendClient>,
    token: String,
    username: String,
}

impl SavedSource {
    pub fn new(
        client: Arc<BackendClient>,
        token: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            username: username.into(),
        }
    }
}

impl PageSource for SavedSource {
    fn fetch_page(&self, cursor: Option<&str>) -> Result<Page> {
        let listing = self.client.saved(&self.token, &self.username, cursor)?;
        Ok(page_from_listing(listing))
    }

    fn describe(&self) -> String {
        format!("saved posts of u/{}", self.username)
    }
}

/// The backend's media folder. The cursor is the next 1-based page number.
pub struct LibrarySource {
    client: Arc<BackendClient>,
    limit: usize,
}

impl LibrarySource {
    pub fn new(client: Arc<BackendClient>, limit: usize) -> Self {
        Self {
            client,
            limit: limit.max(1),
        }
    }
}

impl PageSource for LibrarySource {
    fn fetch_page(&self, cursor: Option<&str>) -> Result<Page> {
        let page = match cursor {
            None => 1,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::InvalidRequest(format!("bad page cursor {raw}")))?,
        };
        let mut listing = self.client.media(page, self.limit)?;
        for thing in &mut listing.children {
            thing.data.url = self.client.absolute(&thing.data.url);
            thing.data.permalink = self.client.absolute(&thing.data.permalink);
        }
        let has_more = listing.after.is_some();
        let mut result = page_from_listing(listing);
        result.next_cursor = has_more.then(|| (page + 1).to_string());
        Ok(result)
    }

    fn describe(&self) -> String {
        format!("media library at {}", self.client.base_url())
    }
}
