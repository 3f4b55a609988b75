use std::fs;
use std::sync::Arc;

use chunk_downloader::download::worker::WorkerSettings;
use chunk_downloader::base_system::retry::RetryPolicy;
use chunk_downloader::{
    ByteRange, DirectLinkResolver, DownloadEvent, Downloader, EventFilter, EventPublisher,
    FetchError, FetchSettings, HttpRangeFetcher, LinkResolver, MetaApiResolver, RangeFetcher,
    ResolveError, TaskRecord, TaskState,
};
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 按请求的 Range 头返回 206 分片。
struct RangeResponder(Vec<u8>);

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.0.clone());
        };
        let mut parts = range.splitn(2, '-');
        let start: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let end: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.0.len() - 1);
        let end = end.min(self.0.len() - 1);
        ResponseTemplate::new(206).set_body_bytes(self.0[start..=end].to_vec())
    }
}

fn fetch_blocking(url: String, range: ByteRange) -> Result<Vec<u8>, FetchError> {
    let mut fetcher = HttpRangeFetcher::new(&FetchSettings::default()).unwrap();
    fetcher.fetch(&url, range)
}

#[tokio::test(flavor = "multi_thread")]
async fn fetcher_sends_inclusive_range_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/object"))
        .and(header("range", "bytes=4-7"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"4567".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/object", server.uri());
    let body = tokio::task::spawn_blocking(move || {
        fetch_blocking(url, ByteRange { start: 4, stop: 8 })
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(body, b"4567");
}

#[tokio::test(flavor = "multi_thread")]
async fn fetcher_rejects_ignored_range_and_bad_lengths() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/full"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content(16)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/short"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b"ab".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let base = server.uri();
    let results = tokio::task::spawn_blocking(move || {
        vec![
            fetch_blocking(format!("{base}/full"), ByteRange { start: 8, stop: 12 }),
            fetch_blocking(format!("{base}/full"), ByteRange { start: 0, stop: 4 }),
            fetch_blocking(format!("{base}/full"), ByteRange { start: 0, stop: 16 }),
            fetch_blocking(format!("{base}/short"), ByteRange { start: 0, stop: 4 }),
            fetch_blocking(format!("{base}/busy"), ByteRange { start: 0, stop: 4 }),
        ]
    })
    .await
    .unwrap();

    let mut results = results.into_iter();
    assert!(matches!(results.next(), Some(Err(FetchError::RangeNotHonoured(_)))));
    assert!(matches!(results.next(), Some(Err(FetchError::RangeNotHonoured(_)))));
    // 200 的整体响应恰好等于请求区间时接受
    assert_eq!(results.next().unwrap().unwrap(), content(16));
    assert!(matches!(
        results.next(),
        Some(Err(FetchError::BodyLength { expected: 4, actual: 2 }))
    ));
    assert!(matches!(
        results.next(),
        Some(Err(FetchError::Status { status: 503, .. }))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_api_resolves_redirect_and_request_id() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/api/meta"))
        .and(query_param("path", "/apps/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "info": [{ "dlink": format!("{base}/dlink/a"), "size": 1024 }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/dlink/a"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{base}/real/a").as_str())
                .insert_header("x-bs-request-id", "req-42"),
        )
        .mount(&server)
        .await;

    let endpoint = format!("{base}/api/meta");
    let (meta, link) = tokio::task::spawn_blocking(move || {
        let resolver = MetaApiResolver::new(endpoint, &FetchSettings::default()).unwrap();
        let meta = resolver.resolve_metadata("/apps/a.bin").unwrap();
        let link = resolver.resolve_direct_link(&meta).unwrap();
        (meta, link)
    })
    .await
    .unwrap();

    assert_eq!(meta.size, Some(1024));
    assert_eq!(meta.dlink, format!("{}/dlink/a", server.uri()));
    assert_eq!(link.url, format!("{}/real/a", server.uri()));
    assert_eq!(link.token, "req-42");
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_api_failures_are_reported() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/api/meta"))
        .and(query_param("path", "/missing"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "errno": 31066 })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/meta"))
        .and(query_param("path", "/nolink"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "errno": 0, "info": [{ "size": 3 }] })),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/dlink/anon"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "http://elsewhere/x"))
        .mount(&server)
        .await;

    let endpoint = format!("{base}/api/meta");
    let (missing, nolink, no_token) = tokio::task::spawn_blocking(move || {
        let resolver = MetaApiResolver::new(endpoint, &FetchSettings::default()).unwrap();
        let missing = resolver.resolve_metadata("/missing").unwrap_err();
        let nolink = resolver.resolve_metadata("/nolink").unwrap_err();
        let meta = chunk_downloader::RemoteMeta {
            path: "/anon".into(),
            dlink: format!("{base}/dlink/anon"),
            size: None,
            revision: None,
        };
        let no_token = resolver.resolve_direct_link(&meta).unwrap_err();
        (missing, nolink, no_token)
    })
    .await
    .unwrap();

    assert!(matches!(missing, ResolveError::Api(31066)));
    assert!(matches!(nolink, ResolveError::MissingField("dlink")));
    assert!(matches!(no_token, ResolveError::EmptyToken));
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_resolver_reads_size_and_etag() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/files/video.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content(48))
                .insert_header("etag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let url = format!("{}/files/video.mp4", server.uri());
    let (meta, link) = tokio::task::spawn_blocking(move || {
        let resolver = DirectLinkResolver::new(&FetchSettings::default()).unwrap();
        let meta = resolver.resolve_metadata(&url).unwrap();
        let link = resolver.resolve_direct_link(&meta).unwrap();
        (meta, link)
    })
    .await
    .unwrap();

    assert_eq!(meta.size, Some(48));
    assert_eq!(link.url, meta.dlink);
    assert_eq!(link.token, "\"v1\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn end_to_end_download_over_http() {
    let server = MockServer::start().await;
    let data = content(10_000);
    Mock::given(method("HEAD"))
        .and(path("/blob"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(data.clone())
                .insert_header("x-request-id", "rid-1"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(RangeResponder(data.clone()))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let save_dir = dir.path().join("nested").join("out");
    let url = format!("{}/blob", server.uri());

    let (record, events) = tokio::task::spawn_blocking(move || {
        let settings = FetchSettings::default();
        let resolver: Arc<dyn LinkResolver> = Arc::new(DirectLinkResolver::new(&settings).unwrap());
        let publisher = EventPublisher::new(16);
        let sub = publisher.subscribe(EventFilter::all());
        let record = TaskRecord::new("e2e", url, save_dir, "blob.bin", 10_000);
        let downloader = Downloader::with_http(
            record,
            &settings,
            resolver,
            publisher,
            WorkerSettings {
                chunk_size: 4096,
                flush_threshold: 2,
                retry: RetryPolicy::from_millis(2, 0, 0),
            },
        )
        .unwrap();
        let (_handle, join) = downloader.spawn().unwrap();
        let record = join.join().unwrap();
        let events: Vec<DownloadEvent> = sub.try_iter().collect();
        (record, events)
    })
    .await
    .unwrap();

    assert_eq!(record.state, TaskState::Finished);
    assert_eq!(
        events,
        vec![
            DownloadEvent::Received { id: "e2e".into(), current_size: 4096 },
            DownloadEvent::Received { id: "e2e".into(), current_size: 8192 },
            DownloadEvent::Received { id: "e2e".into(), current_size: 10_000 },
            DownloadEvent::Downloaded { id: "e2e".into() },
        ]
    );
    let saved = fs::read(dir.path().join("nested").join("out").join("blob.bin")).unwrap();
    assert_eq!(saved, data);
}
