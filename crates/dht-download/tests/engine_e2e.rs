//! Engine end-to-end: a local HTTP origin, a real in-memory archive, and
//! the full enqueue → pull → fetch → record → finished-stream path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;

use dht_core::{
    Attachment, AttachmentFilter, DownloadStatus, Message, Snowflake,
};
use dht_db::Database;
use dht_download::{Downloader, DownloaderConfig};

const PNG_BYTES: &[u8] = b"definitely-a-png";

async fn serve_ok() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], PNG_BYTES)
}

async fn serve_big() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/octet-stream")], vec![0_u8; 4096])
}

async fn serve_missing() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

/// Bind a throwaway origin server on an ephemeral port.
async fn spawn_origin() -> SocketAddr {
    let app = Router::new()
        .route("/ok.png", get(serve_ok))
        .route("/big.bin", get(serve_big))
        .route("/missing.png", get(serve_missing));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn attachment(id: u64, base: SocketAddr, path: &str, size: u64) -> Attachment {
    let url = format!("http://{base}{path}");
    Attachment {
        id: Snowflake(id),
        name: path.trim_start_matches('/').to_owned(),
        content_type: None,
        normalized_url: url.clone(),
        download_url: url,
        size,
        width: None,
        height: None,
    }
}

fn message_with(attachments: Vec<Attachment>) -> Message {
    Message {
        id: Snowflake(1),
        sender_id: Snowflake(2),
        channel_id: Snowflake(3),
        text: "media".to_owned(),
        timestamp: 0,
        edit_timestamp: None,
        replied_to_id: None,
        attachments,
        embeds: Vec::new(),
        reactions: Vec::new(),
        poll: None,
    }
}

#[tokio::test]
async fn engine_classifies_success_failure_and_skip() {
    let origin = spawn_origin().await;
    let db = Database::open_in_memory().await.unwrap();

    db.messages()
        .add(&[message_with(vec![
            attachment(1, origin, "/ok.png", 100),
            attachment(2, origin, "/missing.png", 100),
            attachment(3, origin, "/big.bin", 100),
        ])])
        .await
        .unwrap();

    let enqueued = db
        .downloads()
        .enqueue_download_items(&AttachmentFilter::all())
        .await
        .unwrap();
    assert_eq!(enqueued, 3);

    let config = DownloaderConfig {
        size_cap_bytes: Some(1024),
        ..DownloaderConfig::default()
    };
    let downloader = Downloader::new(db.downloads().clone(), config).unwrap();

    let mut finished = downloader.start().await.unwrap();
    let mut results = Vec::new();
    for _ in 0..3 {
        let item = tokio::time::timeout(Duration::from_secs(10), finished.next())
            .await
            .expect("finished item within deadline")
            .expect("stream open while running");
        results.push(item);
    }
    downloader.stop().await;

    let status_of = |path: &str| {
        results
            .iter()
            .find(|r| r.normalized_url.ends_with(path))
            .map(|r| r.status)
            .unwrap()
    };
    assert_eq!(status_of("/ok.png"), DownloadStatus::Success);
    assert_eq!(status_of("/missing.png"), DownloadStatus::Http(404));
    assert_eq!(status_of("/big.bin"), DownloadStatus::Skipped);

    let stats = db.downloads().get_statistics().await.unwrap();
    assert_eq!(stats.successful.count, 1);
    assert_eq!(stats.failed.count, 1);
    assert_eq!(stats.skipped.count, 1);
    assert_eq!(stats.enqueued.count, 0);
    assert_eq!(stats.successful.total_bytes, PNG_BYTES.len() as u64);

    let (blob, content_type) = db
        .downloads()
        .get_successful_blob(&format!("http://{origin}/ok.png"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(blob, PNG_BYTES);
    assert_eq!(content_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn items_enqueued_while_running_are_picked_up() {
    let origin = spawn_origin().await;
    let db = Database::open_in_memory().await.unwrap();

    let downloader = Downloader::new(
        db.downloads().clone(),
        DownloaderConfig {
            idle_poll_interval: Duration::from_millis(50),
            ..DownloaderConfig::default()
        },
    )
    .unwrap();
    let mut finished = downloader.start().await.unwrap();

    // Engine is already polling an empty queue; feed it afterwards
    db.messages()
        .add(&[message_with(vec![attachment(1, origin, "/ok.png", 100)])])
        .await
        .unwrap();
    db.downloads()
        .enqueue_download_items(&AttachmentFilter::all())
        .await
        .unwrap();

    let item = tokio::time::timeout(Duration::from_secs(10), finished.next())
        .await
        .expect("finished item within deadline")
        .expect("stream open while running");
    assert_eq!(item.status, DownloadStatus::Success);

    downloader.stop().await;
}
