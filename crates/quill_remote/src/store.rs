//! Store backed by a remote HTTP endpoint.
//!
//! Keys map onto URLs below a base: reads are `GET {base}/{key}`, writes are
//! `POST {base}/{key}`. Compiled code is kept in memory and additionally
//! posted as a form carrying its textual source.

use std::sync::Arc;

use async_trait::async_trait;
use quill_store::{
    ArtifactKind, CodeArtifact, CompiledRecord, Content, Lookup, MemoryStore, NamingResolver,
    OpToken, PartialRecord, RecordOrigin, Renderer, Store, StoreError,
};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

use crate::http_client::{ClientError, HttpClient};

const BACKEND: &str = "remote";

/// Store reading and writing artifacts over HTTP.
pub struct RemoteStore {
    base: Url,
    client: HttpClient,
    resolver: Arc<NamingResolver>,
    overlay: MemoryStore,
}

impl RemoteStore {
    /// Creates a store rooted at `base_url`.
    pub fn new(
        base_url: &str,
        client: HttpClient,
        resolver: Arc<NamingResolver>,
    ) -> Result<Self, ClientError> {
        let invalid = |reason: String| ClientError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason,
        };
        let mut base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("URL cannot be a base".to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            base,
            client,
            overlay: MemoryStore::new(resolver.clone()),
            resolver,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Builds the URL of a canonical key, carrying its query part.
    pub fn url_for(&self, key: &str) -> Result<Url, StoreError> {
        let (path, query) = match key.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (key, None),
        };
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| StoreError::http(BACKEND, None, key, e.to_string()))?;
        url.set_query(query);
        Ok(url)
    }

    async fn get(&self, url: Url, token: &OpToken) -> Result<Option<Response>, StoreError> {
        token
            .run("remote read", async {
                let response = self
                    .client
                    .inner()
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| request_failure(&url, e))?;
                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    debug!(url = %url, "remote artifact not found");
                    return Ok(None);
                }
                if !status.is_success() {
                    return Err(status_failure(&url, status));
                }
                let is_json = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.contains("json"));
                let body = response
                    .text()
                    .await
                    .map_err(|e| request_failure(&url, e))?;
                Ok(Some(Response { body, is_json }))
            })
            .await
    }

    async fn post(
        &self,
        url: Url,
        content_type: &'static str,
        body: String,
        token: &OpToken,
    ) -> Result<(), StoreError> {
        token
            .run("remote write", async {
                let response = self
                    .client
                    .inner()
                    .post(url.clone())
                    .header(CONTENT_TYPE, content_type)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| request_failure(&url, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_failure(&url, status));
                }
                debug!(url = %url, status = status.as_u16(), "posted artifact");
                Ok(())
            })
            .await
    }
}

struct Response {
    body: String,
    is_json: bool,
}

fn request_failure(url: &Url, error: reqwest::Error) -> StoreError {
    StoreError::http(
        BACKEND,
        error.status().map(|s| s.as_u16()),
        url.as_str(),
        error.to_string(),
    )
}

fn status_failure(url: &Url, status: StatusCode) -> StoreError {
    StoreError::http(
        BACKEND,
        Some(status.as_u16()),
        url.as_str(),
        format!("unexpected status {status}"),
    )
}

/// Content type used when posting textual content.
fn text_content_type(key: &str) -> &'static str {
    let path = key.split_once('?').map_or(key, |(path, _)| path);
    if path.ends_with(".html") || path.ends_with(".htm") {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn key_extension(key: &str) -> Option<&str> {
    let path = key.split_once('?').map_or(key, |(path, _)| path);
    let last = path.rsplit('/').next()?;
    last.rsplit_once('.').map(|(_, ext)| ext)
}

#[async_trait]
impl Store for RemoteStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn resolver(&self) -> &NamingResolver {
        &self.resolver
    }

    fn overlay(&self) -> &MemoryStore {
        &self.overlay
    }

    async fn read_content(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        if let Some(hit) = self.overlay.get_partial(&key) {
            return Ok(Some(hit));
        }

        let url = self.url_for(&key)?;
        let Some(response) = self.get(url, token).await? else {
            return Ok(None);
        };
        let extension = key_extension(&key);
        let content = if response.is_json {
            Content::from_source(response.body, Some("json"))
        } else {
            Content::from_source(response.body, extension)
        };
        let record = PartialRecord::new(lookup.name, key.as_str(), content, RecordOrigin::Discovered)
            .with_extension(extension)
            .with_params(lookup.params.cloned());
        Ok(Some(self.overlay.put_partial(record)))
    }

    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        let url = self.url_for(&key)?;
        let (content_type, body) = match &content {
            Content::Json(value) => ("application/json", value.to_string()),
            Content::Text(text) => (text_content_type(&key), text.clone()),
        };
        self.post(url, content_type, body, token).await?;

        let record = PartialRecord::new(lookup.name, key, content, RecordOrigin::Explicit)
            .with_extension(lookup.extension)
            .with_params(lookup.params.cloned());
        Ok(self.overlay.put_partial(record))
    }

    async fn read_code(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<CodeArtifact>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Code)?;
        if let Some(hit) = self.overlay.get_compiled(&key) {
            return Ok(Some(CodeArtifact::Live(hit)));
        }
        let url = self.url_for(&key)?;
        Ok(self
            .get(url, token)
            .await?
            .map(|response| CodeArtifact::Text {
                canonical_key: key,
                name: lookup.name.to_string(),
                source: response.body,
            }))
    }

    async fn write_code(
        &self,
        lookup: Lookup<'_>,
        renderer: Arc<dyn Renderer>,
        token: &OpToken,
    ) -> Result<Arc<CompiledRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Code)?;
        if let Some(source) = renderer.source() {
            let form = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("name", lookup.name)
                .append_pair("renderer", source)
                .finish();
            let url = self.url_for(&key)?;
            self.post(url, "application/x-www-form-urlencoded", form, token)
                .await?;
        }
        Ok(self
            .overlay
            .put_compiled(CompiledRecord::new(key, lookup.name, renderer)))
    }

    async fn unregister(&self, name: &str, _token: &OpToken) -> Result<(), StoreError> {
        self.overlay.remove_name(name);
        Ok(())
    }

    async fn clear(&self, _all: bool, _token: &OpToken) -> Result<(), StoreError> {
        self.overlay.clear();
        Ok(())
    }
}
