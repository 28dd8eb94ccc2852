//! Blob storage backends + HTTP fetch utilities for WXP.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wxp-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub name: String,
    pub content_hash: String,
    pub byte_size: usize,
}

impl StoredBlob {
    fn for_bytes(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Named blobs under a single container. `put` always overwrites.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob>;
    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>>;
    /// Blob names starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    /// Deleting a missing blob is not an error.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}

/// Removes every blob under `prefix`, returning how many were deleted.
pub async fn clear_prefix(store: &dyn ObjectStore, prefix: &str) -> anyhow::Result<usize> {
    let names = store.list(prefix).await?;
    for name in &names {
        store.delete(name).await?;
    }
    Ok(names.len())
}

fn validate_blob_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("blob name must not be empty");
    }
    let path = Path::new(name);
    if path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("blob name {name:?} must be a relative path without `..`");
    }
    Ok(())
}

/// Filesystem-backed store. Writes go through a temp file + rename so readers never see a
/// partially written blob.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> anyhow::Result<PathBuf> {
        validate_blob_name(name)?;
        Ok(self.root.join(name))
    }

    async fn collect_names(&self, dir: PathBuf, out: &mut Vec<String>) -> anyhow::Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("listing {}", dir.display()));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading entry in {}", dir.display()))?
            {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let file_name = entry.file_name();
                if file_name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let relative = path.strip_prefix(&self.root).unwrap_or(&path);
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let absolute_path = self.blob_path(name)?;
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp blob {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(StoredBlob::for_bytes(name, bytes))
    }

    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.blob_path(name)?;
        fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect_names(self.root.clone(), &mut names).await?;
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting blob {}", path.display())),
        }
    }
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn names(&self) -> Vec<String> {
        self.blobs.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        validate_blob_name(name)?;
        self.blobs
            .lock()
            .await
            .insert(name.to_string(), bytes.to_vec());
        Ok(StoredBlob::for_bytes(name, bytes))
    }

    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .lock()
            .await
            .get(name)
            .cloned()
            .with_context(|| format!("blob {name} not found"))
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .blobs
            .lock()
            .await
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.blobs.lock().await.remove(name);
        Ok(())
    }
}

const AZURE_API_VERSION: &str = "2021-08-06";

#[derive(Debug, Clone)]
pub struct AzureBlobConfig {
    pub account: String,
    pub container: String,
    /// Shared access signature scoped to the container; a leading `?` is ignored.
    pub sas_token: String,
    /// Overrides `https://{account}.blob.core.windows.net`, e.g. for Azurite.
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

/// Azure Blob Storage over its REST API, authenticated with a SAS token.
#[derive(Debug)]
pub struct AzureBlobStore {
    client: reqwest::Client,
    container_url: String,
    sas_token: String,
}

impl AzureBlobStore {
    pub fn new(config: AzureBlobConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building blob storage client")?;
        let endpoint = config
            .endpoint
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account));
        Ok(Self {
            client,
            container_url: format!("{}/{}", endpoint.trim_end_matches('/'), config.container),
            sas_token: config.sas_token.trim_start_matches('?').to_string(),
        })
    }

    pub fn blob_url(&self, name: &str) -> String {
        format!(
            "{}/{}?{}",
            self.container_url,
            encode_blob_path(name),
            self.sas_token
        )
    }

    pub fn list_url(&self, prefix: &str, marker: Option<&str>) -> String {
        let mut url = format!(
            "{}?restype=container&comp=list&prefix={}",
            self.container_url,
            encode_query_value(prefix)
        );
        if let Some(marker) = marker {
            url.push_str("&marker=");
            url.push_str(&encode_query_value(marker));
        }
        url.push('&');
        url.push_str(&self.sas_token);
        url
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        validate_blob_name(name)?;
        let resp = self
            .client
            .put(self.blob_url(name))
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", AZURE_API_VERSION)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("uploading blob {name}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("uploading blob {name} returned http status {status}");
        }
        Ok(StoredBlob::for_bytes(name, bytes))
    }

    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.blob_url(name))
            .header("x-ms-version", AZURE_API_VERSION)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("downloading blob {name}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("downloading blob {name} returned http status {status}");
        }
        Ok(resp
            .bytes()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("reading blob body {name}"))?
            .to_vec())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = self
                .client
                .get(self.list_url(prefix, marker.as_deref()))
                .header("x-ms-version", AZURE_API_VERSION)
                .send()
                .await
                .map_err(reqwest::Error::without_url)
                .with_context(|| format!("listing blobs under {prefix}"))?;
            let status = resp.status();
            if !status.is_success() {
                bail!("listing blobs under {prefix} returned http status {status}");
            }
            let body = resp
                .text()
                .await
                .map_err(reqwest::Error::without_url)
                .context("reading blob listing")?;
            names.extend(xml_tag_values(&body, "Name"));
            marker = xml_tag_values(&body, "NextMarker")
                .into_iter()
                .find(|m| !m.is_empty());
            if marker.is_none() {
                break;
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.blob_url(name))
            .header("x-ms-version", AZURE_API_VERSION)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("deleting blob {name}"))?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            bail!("deleting blob {name} returned http status {status}")
        }
    }
}

/// Text content of every `<tag>...</tag>` element, XML entities decoded.
pub fn xml_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        out.push(decode_xml_entities(&after[..end]));
        rest = &after[end + close.len()..];
    }
    out
}

fn decode_xml_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
/// Percent-encodes each `/`-separated segment of a blob name, keeping the separators.
pub fn encode_blob_path(name: &str) -> String {
    name.split('/')
        .map(encode_query_value)
        .collect::<Vec<_>>()
        .join("/")
}

pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request URL is stripped so credentials in query strings never reach logs.
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.without_url())
    }
}

/// Single-attempt GET client. Any HTTP status is returned to the caller; retry decisions
/// belong to the stage graph.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch(&self, label: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("fetch semaphore is never closed");

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?.to_vec();
            debug!(%status, bytes = body.len(), "http response received");
            Ok::<_, FetchError>(FetchedResponse { status, body })
        }
        .instrument(info_span!("http_fetch", label))
        .await
    }
}
