//! End-to-end queue scenarios: queue message in, actions run, message settled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blob_store::{BlobStore, ByteStream};
use bytes::Bytes;
use event_relay::RelayService;
use event_relay::actions::{Action, ActionError, ActionKind};
use event_relay::config::RelayConfig;
use event_relay::envelope::Envelope;
use event_relay::pipeline::ActionChain;
use event_relay::receivers::{QueueReceiver, QueueReceiverConfig, Receiver};
use event_relay::transport::MemoryQueue;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BLOB_CREATED: &str = "Microsoft.Storage.BlobCreated";

fn blob_event(container: &str, name: &str, event_type: &str) -> Value {
    json!({
        "id": Uuid::new_v4().to_string(),
        "topic": "/subscriptions/x/resourceGroups/y/providers/Microsoft.Storage/storageAccounts/z",
        "subject": format!("/blobServices/default/containers/{container}/blobs/{name}"),
        "eventType": event_type,
        "eventTime": "2024-05-01T12:00:00Z",
        "dataVersion": "1.0",
        "data": { "api": "PutBlob" }
    })
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn has_temp_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
        })
        .unwrap_or(false)
}

fn download_service(
    queue: &Arc<MemoryQueue>,
    allowed: &[&str],
    remote: &Path,
    local: &Path,
) -> RelayService {
    let config = RelayConfig {
        shutdown_timeout_secs: 5,
        receivers: vec![json!({
            "type": "queue",
            "name": "blob-events",
            "allowed_event_types": allowed,
            "transport": { "kind": "connector", "connector": "events" },
            "actions": [{
                "type": "object_download",
                "local_download_path": local,
                "store": { "kind": "local", "root": remote }
            }]
        })],
        ..RelayConfig::default()
    };
    RelayService::from_config(config).with_queue_connector("events", queue.clone())
}

fn remote_with_blob(temp_dir: &TempDir, content: &[u8]) -> PathBuf {
    let remote = temp_dir.path().join("remote");
    std::fs::create_dir_all(remote.join("raw")).unwrap();
    std::fs::write(remote.join("raw/img1.png"), content).unwrap();
    remote
}

#[tokio::test]
async fn test_blob_created_is_downloaded_then_acknowledged() {
    let temp_dir = TempDir::new().unwrap();
    let remote = remote_with_blob(&temp_dir, b"png bytes");
    let local = temp_dir.path().join("local");
    let queue = Arc::new(MemoryQueue::new("events").with_receive_timeout(Duration::from_millis(50)));

    let service = download_service(&queue, &[BLOB_CREATED], &remote, &local);
    assert_eq!(service.start().await.unwrap(), 1);

    queue.send(serde_json::to_vec(&blob_event("raw", "img1.png", BLOB_CREATED)).unwrap());
    wait_until("message completion", || queue.completed_count() == 1).await;
    service.stop().await.unwrap();

    assert_eq!(std::fs::read(local.join("img1.png")).unwrap(), b"png bytes");
    assert!(!has_temp_files(&local));
    assert_eq!(queue.pending_count(), 0);
    assert!(queue.is_closed());
}

#[tokio::test]
async fn test_filtered_event_is_acknowledged_without_download() {
    let temp_dir = TempDir::new().unwrap();
    let remote = remote_with_blob(&temp_dir, b"png bytes");
    let local = temp_dir.path().join("local");
    let queue = Arc::new(MemoryQueue::new("events").with_receive_timeout(Duration::from_millis(50)));

    let service = download_service(&queue, &["SomeOtherType"], &remote, &local);
    service.start().await.unwrap();

    queue.send(serde_json::to_vec(&blob_event("raw", "img1.png", BLOB_CREATED)).unwrap());
    wait_until("message completion", || queue.completed_count() == 1).await;
    service.stop().await.unwrap();

    assert!(!local.join("img1.png").exists());
}

/// Local store whose reads fail after the first chunk.
struct FailingStore {
    root: PathBuf,
}

#[async_trait]
impl BlobStore for FailingStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn get(&self, _container: &str, _name: &str) -> blob_store::Result<ByteStream> {
        let chunks = vec![
            Ok(Bytes::from_static(b"partial ")),
            Err(blob_store::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset mid-stream",
            ))),
        ];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn put_file(&self, _: &str, _: &str, _: &Path, _: bool) -> blob_store::Result<()> {
        Ok(())
    }

    async fn delete(&self, _: &str, _: &str) -> blob_store::Result<()> {
        Ok(())
    }

    async fn list(&self, _: &str, _: Option<&str>) -> blob_store::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn container_exists(&self, _: &str) -> blob_store::Result<bool> {
        Ok(true)
    }

    async fn create_container_if_not_exists(&self, _: &str) -> blob_store::Result<()> {
        Ok(())
    }

    async fn set_content_type(&self, _: &str, _: &str, _: &str) -> blob_store::Result<()> {
        Ok(())
    }

    async fn set_tags(&self, _: &str, _: &str, _: &HashMap<String, String>) -> blob_store::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_mid_stream_failure_leaves_previous_file_and_message() {
    let temp_dir = TempDir::new().unwrap();
    let remote = temp_dir.path().join("remote");
    let local = temp_dir.path().join("local");
    std::fs::create_dir_all(&local).unwrap();
    std::fs::write(local.join("img1.png"), b"previous version").unwrap();

    let queue = Arc::new(
        MemoryQueue::new("events")
            .with_receive_timeout(Duration::from_millis(50))
            .with_lock_duration(Duration::from_millis(200)),
    );
    let service = download_service(&queue, &[BLOB_CREATED], &remote, &local)
        .with_blob_store(Arc::new(FailingStore { root: remote.clone() }));
    service.start().await.unwrap();

    queue.send(serde_json::to_vec(&blob_event("raw", "img1.png", BLOB_CREATED)).unwrap());
    wait_until("redelivery", || queue.delivery_count() >= 2).await;
    service.stop().await.unwrap();

    assert_eq!(queue.completed_count(), 0);
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(std::fs::read(local.join("img1.png")).unwrap(), b"previous version");
    assert!(!has_temp_files(&local));
}

/// Records correlation ids and fails the first `failures` calls.
struct Recorder {
    name: String,
    correlation_ids: Arc<Mutex<Vec<Uuid>>>,
    calls: Arc<AtomicUsize>,
    failures: usize,
}

#[async_trait]
impl Action for Recorder {
    fn kind(&self) -> ActionKind {
        ActionKind::ExternalProcess
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, envelope: &Envelope, _cancel: &CancellationToken) -> Result<(), ActionError> {
        self.correlation_ids.lock().push(envelope.correlation_id());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ActionError::new(self.kind(), &self.name, "transient failure"));
        }
        Ok(())
    }
}

fn recorder(name: &str, failures: usize) -> (Arc<Recorder>, Arc<Mutex<Vec<Uuid>>>, Arc<AtomicUsize>) {
    let correlation_ids = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let action = Arc::new(Recorder {
        name: name.to_string(),
        correlation_ids: correlation_ids.clone(),
        calls: calls.clone(),
        failures,
    });
    (action, correlation_ids, calls)
}

fn queue_receiver(queue: &Arc<MemoryQueue>, actions: Vec<Arc<dyn Action>>) -> QueueReceiver {
    let config: QueueReceiverConfig = serde_json::from_value(json!({
        "name": "blob-events",
        "transport": { "kind": "connector", "connector": "events" }
    }))
    .unwrap();
    let chain = ActionChain::new("blob-events", [BLOB_CREATED.to_string()], actions);
    QueueReceiver::new(config, queue.clone(), Arc::new(chain), CancellationToken::new())
}

#[tokio::test]
async fn test_batch_fans_out_with_distinct_correlation_ids_and_one_ack() {
    let queue = Arc::new(MemoryQueue::new("events").with_receive_timeout(Duration::from_millis(50)));
    let (action, correlation_ids, calls) = recorder("record", 0);
    let receiver = queue_receiver(&queue, vec![action as Arc<dyn Action>]);

    let batch: Vec<Value> = (0..4)
        .map(|i| blob_event("raw", &format!("img{i}.png"), BLOB_CREATED))
        .collect();
    queue.send(serde_json::to_vec(&batch).unwrap());

    receiver.start().await.unwrap();
    wait_until("message completion", || queue.completed_count() == 1).await;
    receiver.stop().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let mut ids = correlation_ids.lock().clone();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(queue.completed_count(), 1);
    assert_eq!(queue.delivery_count(), 1);
}

#[tokio::test]
async fn test_redelivery_reruns_the_whole_chain() {
    let queue = Arc::new(
        MemoryQueue::new("events")
            .with_receive_timeout(Duration::from_millis(50))
            .with_lock_duration(Duration::from_millis(150)),
    );
    let (first, first_ids, first_calls) = recorder("first", 0);
    let (second, _, second_calls) = recorder("second", 1);
    let receiver = queue_receiver(&queue, vec![first as Arc<dyn Action>, second]);

    queue.send(serde_json::to_vec(&blob_event("raw", "img1.png", BLOB_CREATED)).unwrap());

    receiver.start().await.unwrap();
    wait_until("message completion", || queue.completed_count() == 1).await;
    receiver.stop().await.unwrap();

    assert_eq!(queue.delivery_count(), 2);
    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_calls.load(Ordering::SeqCst), 2);
    let ids = first_ids.lock();
    assert_ne!(ids[0], ids[1]);
}
