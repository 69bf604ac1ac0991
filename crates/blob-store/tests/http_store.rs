//! HTTP blob store tests against a mock REST endpoint.

use std::collections::HashMap;

use blob_store::{BlobStore, Error, HttpBlobStore, HttpBlobStoreConfig};
use futures::TryStreamExt;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> HttpBlobStore {
    HttpBlobStore::new(config_for(server)).unwrap()
}

fn config_for(server: &MockServer) -> HttpBlobStoreConfig {
    HttpBlobStoreConfig {
        timeout_secs: 5,
        ..HttpBlobStoreConfig::new(Url::parse(&server.uri()).unwrap(), "sv=2021&sig=secret")
    }
}

#[tokio::test]
async fn test_get_streams_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/img1.png"))
        .and(query_param("sig", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image-bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let chunks: Vec<bytes::Bytes> = store
        .get("raw", "img1.png")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"image-bytes");
}

#[tokio::test]
async fn test_get_missing_blob() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/missing.png"))
        .respond_with(ResponseTemplate::new(404).insert_header("x-ms-error-code", "BlobNotFound"))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let err = store.get("raw", "missing.png").await.err().unwrap();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_put_file_without_overwrite() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/uploads/sub/a.txt"))
        .and(header("x-ms-blob-type", "BlockBlob"))
        .and(header("if-none-match", "*"))
        .respond_with(ResponseTemplate::new(409).insert_header("x-ms-error-code", "BlobAlreadyExists"))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.txt");
    tokio::fs::write(&source, b"hello").await.unwrap();

    let store = store_for(&server);
    let err = store
        .put_file("uploads", "sub/a.txt", &source, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_put_file_uploads_content() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/uploads/a.txt"))
        .and(header("content-length", "5"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("a.txt");
    tokio::fs::write(&source, b"hello").await.unwrap();

    let store = store_for(&server);
    store.put_file("uploads", "a.txt", &source, true).await.unwrap();
}

#[tokio::test]
async fn test_put_file_above_limit_uploads_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/uploads/big.bin"))
        .and(query_param("comp", "block"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/uploads/big.bin"))
        .and(query_param("comp", "blocklist"))
        .and(header("if-none-match", "*"))
        .and(body_string_contains("<BlockList><Latest>"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/uploads/big.bin"))
        .and(header("x-ms-blob-type", "BlockBlob"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("big.bin");
    tokio::fs::write(&source, b"0123456789").await.unwrap();

    let store = HttpBlobStore::new(HttpBlobStoreConfig {
        single_put_limit_bytes: 4,
        block_size_bytes: 4,
        ..config_for(&server)
    })
    .unwrap();
    store.put_file("uploads", "big.bin", &source, false).await.unwrap();
}

#[tokio::test]
async fn test_create_container_tolerates_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/uploads"))
        .and(query_param("restype", "container"))
        .respond_with(ResponseTemplate::new(409).insert_header("x-ms-error-code", "ContainerAlreadyExists"))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    store.create_container_if_not_exists("uploads").await.unwrap();
}

#[tokio::test]
async fn test_container_exists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/present"))
        .and(query_param("restype", "container"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/absent"))
        .and(query_param("restype", "container"))
        .respond_with(ResponseTemplate::new(404).insert_header("x-ms-error-code", "ContainerNotFound"))
        .mount(&server)
        .await;

    let store = store_for(&server);
    assert!(store.container_exists("present").await.unwrap());
    assert!(!store.container_exists("absent").await.unwrap());
}

#[tokio::test]
async fn test_list_follows_markers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw"))
        .and(query_param("comp", "list"))
        .and(query_param("marker", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<EnumerationResults><Blobs><Blob><Name>c&#x263A;.txt</Name></Blob></Blobs><NextMarker /></EnumerationResults>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/raw"))
        .and(query_param("comp", "list"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<EnumerationResults><Blobs><Blob><Name>a.txt</Name></Blob><Blob><Name>b&amp;b.txt</Name></Blob></Blobs><NextMarker>page2</NextMarker></EnumerationResults>",
        ))
        .mount(&server)
        .await;

    let store = store_for(&server);
    let names = store.list("raw", None).await.unwrap();
    assert_eq!(names, vec!["a.txt", "b&b.txt", "c\u{263A}.txt"]);
}

#[tokio::test]
async fn test_set_tags_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/raw/a.png"))
        .and(query_param("comp", "tags"))
        .and(body_string_contains("<Key>origin</Key><Value>relay</Value>"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/raw/a.png"))
        .and(query_param("comp", "properties"))
        .and(header("x-ms-blob-content-type", "image/png"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    let tags = HashMap::from([("origin".to_string(), "relay".to_string())]);
    store.set_tags("raw", "a.png", &tags).await.unwrap();
    store.set_content_type("raw", "a.png", "image/png").await.unwrap();
}
