use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spf_enrich::{AreaStatsCache, HttpAreaStatsProvider, RefreshPolicy};
use spf_storage::{HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers every request with a 503 and counts them.
async fn unavailable_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (format!("http://{addr}"), hits)
}

#[tokio::test]
async fn failing_metric_is_requested_once_plus_one_retry() {
    let (base, hits) = unavailable_server().await;
    // Default client config retries transient statuses; the area-stats path must not.
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let provider = HttpAreaStatsProvider::with_templates(
        http,
        format!("{base}/prices/{{area}}"),
        format!("{base}/rents/{{area}}"),
    );

    let mut cache = AreaStatsCache::new();
    let codes = BTreeSet::from(["L4".to_string()]);
    let report = cache.refresh(&codes, &provider, &RefreshPolicy::immediate()).await;

    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed_metrics, 2);
    assert_eq!(cache.get("L4").avg_rent, None);
}
