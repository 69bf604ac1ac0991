//! Azure-Blob-compatible REST client.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::{BlobStore, ByteStream, Error, Result, name_segments};

const API_VERSION: &str = "2021-08-06";
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

fn default_timeout() -> u64 {
    60
}

fn default_single_put_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_block_size() -> usize {
    8 * 1024 * 1024
}

/// Connection settings for [`HttpBlobStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBlobStoreConfig {
    /// Account endpoint, e.g. `https://account.blob.core.windows.net`.
    pub account_url: Url,
    /// Shared access signature query string (with or without a leading `?`).
    pub sas_token: String,
    /// Timeout for metadata requests in seconds. Streaming transfers are not bounded.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Files up to this size are uploaded with a single request, larger ones in blocks.
    #[serde(default = "default_single_put_limit")]
    pub single_put_limit_bytes: u64,
    #[serde(default = "default_block_size")]
    pub block_size_bytes: usize,
}

impl HttpBlobStoreConfig {
    pub fn new(account_url: Url, sas_token: impl Into<String>) -> Self {
        Self {
            account_url,
            sas_token: sas_token.into(),
            timeout_secs: default_timeout(),
            single_put_limit_bytes: default_single_put_limit(),
            block_size_bytes: default_block_size(),
        }
    }
}

/// Object store speaking the Azure Blob REST protocol.
pub struct HttpBlobStore {
    config: HttpBlobStoreConfig,
    client: Client,
}

impl HttpBlobStore {
    pub fn new(config: HttpBlobStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, container: &str, name: Option<&str>, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.config.account_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| Error::InvalidName {
                name: self.config.account_url.to_string(),
                reason: "account url cannot be a base",
            })?;
            segments.pop_if_empty().push(container);
            if let Some(name) = name {
                for segment in name_segments(name)? {
                    segments.push(segment);
                }
            }
        }

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        let sas = self.config.sas_token.trim_start_matches('?');
        if !sas.is_empty() {
            let query = match url.query() {
                Some(q) if !q.is_empty() => format!("{q}&{sas}"),
                _ => sas.to_string(),
            };
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url).header("x-ms-version", API_VERSION)
    }

    fn metadata_request(&self, method: Method, url: Url) -> RequestBuilder {
        self.request(method, url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
    }
}

/// Map a non-success response onto a store error.
async fn check(
    response: Response,
    operation: &'static str,
    container: &str,
    name: Option<&str>,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match (status, error_code.as_deref(), name) {
        (StatusCode::NOT_FOUND, Some("ContainerNotFound"), _) | (StatusCode::NOT_FOUND, _, None) => {
            Err(Error::ContainerNotFound(container.to_string()))
        }
        (StatusCode::NOT_FOUND, _, Some(name)) => Err(Error::not_found(container, name)),
        (StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED, _, Some(name)) => {
            Err(Error::AlreadyExists {
                container: container.to_string(),
                name: name.to_string(),
            })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Status {
                operation,
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Body of a List Blobs response. Only the fields the client reads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobItems,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobItems {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "Tags")]
struct TagsDocument<'a> {
    #[serde(rename = "TagSet")]
    tag_set: TagSet<'a>,
}

#[derive(Debug, Serialize)]
struct TagSet<'a> {
    #[serde(rename = "Tag")]
    tags: Vec<Tag<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Tag<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename = "BlockList")]
struct BlockList<'a> {
    #[serde(rename = "Latest")]
    latest: &'a [String],
}

fn to_xml<T: Serialize>(document: &T) -> Result<String> {
    let body = quick_xml::se::to_string(document).map_err(|e| Error::Xml(e.to_string()))?;
    Ok(format!("{XML_DECLARATION}{body}"))
}

fn parse_listing(body: &str) -> Result<(Vec<String>, Option<String>)> {
    let listing: EnumerationResults =
        quick_xml::de::from_str(body).map_err(|e| Error::Xml(e.to_string()))?;
    let names = listing.blobs.items.into_iter().map(|b| b.name).collect();
    let marker = listing.next_marker.filter(|m| !m.is_empty());
    Ok((names, marker))
}

fn tags_body(tags: &HashMap<String, String>) -> Result<String> {
    let mut tags: Vec<Tag<'_>> = tags
        .iter()
        .map(|(key, value)| Tag { key, value })
        .collect();
    tags.sort_by(|a, b| a.key.cmp(b.key));
    to_xml(&TagsDocument {
        tag_set: TagSet { tags },
    })
}

/// Block ids must all have the same length within a blob.
fn block_id(index: u32) -> String {
    BASE64.encode(format!("block-{index:08}"))
}

impl HttpBlobStore {
    /// Stage the file as blocks and commit them with a block list.
    async fn put_blocks(
        &self,
        container: &str,
        name: &str,
        path: &Path,
        mut file: tokio::fs::File,
        overwrite: bool,
    ) -> Result<()> {
        let block_size = self.config.block_size_bytes.max(1);
        let mut block_ids = Vec::new();

        loop {
            let mut block = Vec::with_capacity(block_size);
            (&mut file)
                .take(block_size as u64)
                .read_to_end(&mut block)
                .await
                .map_err(|e| Error::io_path("reading upload source", path, e))?;
            if block.is_empty() {
                break;
            }

            let id = block_id(block_ids.len() as u32);
            let url = self.url(container, Some(name), &[("comp", "block"), ("blockid", &id)])?;
            let response = self
                .request(Method::PUT, url)
                .header(reqwest::header::CONTENT_LENGTH, block.len())
                .body(block)
                .send()
                .await?;
            check(response, "put block", container, Some(name)).await?;
            block_ids.push(id);
        }

        let url = self.url(container, Some(name), &[("comp", "blocklist")])?;
        let mut request = self
            .request(Method::PUT, url)
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=UTF-8")
            .body(to_xml(&BlockList { latest: &block_ids })?);
        if !overwrite {
            request = request.header(reqwest::header::IF_NONE_MATCH, "*");
        }
        let response = request.send().await?;
        check(response, "put block list", container, Some(name)).await?;
        debug!(container, name, blocks = block_ids.len(), "Uploaded blob in blocks");
        Ok(())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    fn describe(&self) -> String {
        format!("http:{}", self.config.account_url)
    }

    async fn get(&self, container: &str, name: &str) -> Result<ByteStream> {
        let url = self.url(container, Some(name), &[])?;
        let response = self.request(Method::GET, url).send().await?;
        let response = check(response, "get blob", container, Some(name)).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::Http))
            .boxed())
    }

    async fn put_file(
        &self,
        container: &str,
        name: &str,
        path: &Path,
        overwrite: bool,
    ) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::io_path("opening upload source", path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::io_path("reading upload source metadata", path, e))?
            .len();

        if len > self.config.single_put_limit_bytes {
            return self.put_blocks(container, name, path, file, overwrite).await;
        }

        let url = self.url(container, Some(name), &[])?;
        let mut request = self
            .request(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if !overwrite {
            request = request.header(reqwest::header::IF_NONE_MATCH, "*");
        }

        let response = request.send().await?;
        check(response, "put blob", container, Some(name)).await?;
        debug!(container, name, bytes = len, "Uploaded blob");
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        let url = self.url(container, Some(name), &[])?;
        let response = self.metadata_request(Method::DELETE, url).send().await?;
        check(response, "delete blob", container, Some(name)).await?;
        Ok(())
    }

    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![("restype", "container"), ("comp", "list")];
            if let Some(prefix) = prefix {
                params.push(("prefix", prefix));
            }
            if let Some(marker) = marker.as_deref() {
                params.push(("marker", marker));
            }

            let url = self.url(container, None, &params)?;
            let response = self.metadata_request(Method::GET, url).send().await?;
            let body = check(response, "list blobs", container, None)
                .await?
                .text()
                .await?;

            let (page, next) = parse_listing(&body)?;
            names.extend(page);

            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(names)
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        let url = self.url(container, None, &[("restype", "container")])?;
        let response = self.metadata_request(Method::GET, url).send().await?;
        match check(response, "get container properties", container, None).await {
            Ok(_) => Ok(true),
            Err(Error::ContainerNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<()> {
        let url = self.url(container, None, &[("restype", "container")])?;
        let response = self.metadata_request(Method::PUT, url).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check(response, "create container", container, None).await?;
        debug!(container, "Created container");
        Ok(())
    }

    async fn set_content_type(&self, container: &str, name: &str, content_type: &str) -> Result<()> {
        let url = self.url(container, Some(name), &[("comp", "properties")])?;
        let response = self
            .metadata_request(Method::PUT, url)
            .header("x-ms-blob-content-type", content_type)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check(response, "set blob properties", container, Some(name)).await?;
        Ok(())
    }

    async fn set_tags(
        &self,
        container: &str,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        let url = self.url(container, Some(name), &[("comp", "tags")])?;
        let response = self
            .metadata_request(Method::PUT, url)
            .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=UTF-8")
            .body(tags_body(tags)?)
            .send()
            .await?;
        check(response, "set blob tags", container, Some(name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str, sas: &str) -> HttpBlobStore {
        HttpBlobStore::new(HttpBlobStoreConfig::new(Url::parse(url).unwrap(), sas)).unwrap()
    }

    #[test]
    fn test_url_building() {
        let store = store("https://acct.blob.core.windows.net", "?sv=2021&sig=abc");
        let url = store.url("raw", Some("dir/img 1.png"), &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.blob.core.windows.net/raw/dir/img%201.png?sv=2021&sig=abc"
        );

        let url = store
            .url("raw", None, &[("restype", "container"), ("comp", "list")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.blob.core.windows.net/raw?restype=container&comp=list&sv=2021&sig=abc"
        );
    }

    #[test]
    fn test_url_rejects_traversal() {
        let store = store("https://acct.blob.core.windows.net", "");
        assert!(store.url("raw", Some("../secret"), &[]).is_err());
    }

    #[test]
    fn test_tags_body() {
        let tags = HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "x&y".to_string()),
        ]);
        assert_eq!(
            tags_body(&tags).unwrap(),
            r#"<?xml version="1.0" encoding="utf-8"?><Tags><TagSet><Tag><Key>a</Key><Value>x&amp;y</Value></Tag><Tag><Key>b</Key><Value>2</Value></Tag></TagSet></Tags>"#
        );
    }

    #[test]
    fn test_parse_listing_unescapes_names() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="raw">
  <Prefix>dir/</Prefix>
  <Blobs>
    <Blob><Name>dir/a&amp;b.txt</Name><Properties><Content-Length>3</Content-Length></Properties></Blob>
    <Blob><Name>dir/smile&#x263A;.txt</Name><Properties /></Blob>
  </Blobs>
  <NextMarker>page-2</NextMarker>
</EnumerationResults>"#;

        let (names, marker) = parse_listing(body).unwrap();
        assert_eq!(names, vec!["dir/a&b.txt", "dir/smile\u{263A}.txt"]);
        assert_eq!(marker.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_parse_listing_last_page() {
        let (names, marker) =
            parse_listing("<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>").unwrap();
        assert!(names.is_empty());
        assert!(marker.is_none());

        assert!(matches!(parse_listing("<EnumerationResults><Blobs>"), Err(Error::Xml(_))));
    }

    #[test]
    fn test_block_ids_have_equal_length() {
        assert_eq!(block_id(0).len(), block_id(123_456).len());
        assert_ne!(block_id(0), block_id(1));
    }
}
