//! End-to-end tests for Gateway::fetch against an in-memory block store

use async_trait::async_trait;
use bytes::Bytes;
use iroh_car::CarReader;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trustless_gateway::dag_builder::DagBuilder;
use trustless_gateway::models::codecs;
use trustless_gateway::name_resolver::{
    NameResolver, ResolveOptions, ResolvedName, StaticNameResolver,
};
use trustless_gateway::store::FetchOptions;
use trustless_gateway::{
    BlockStore, Gateway, GatewayConfig, GatewayError, GatewayResponse, MemoryBlockStore,
    RequestOptions, Result,
};

struct Fixture {
    store: Arc<MemoryBlockStore>,
    builder: DagBuilder,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        Fixture {
            builder: DagBuilder::new(store.clone()),
            store,
        }
    }

    fn gateway(&self) -> Gateway {
        Gateway::builder(GatewayConfig::offline())
            .with_store(self.store.clone())
            .build()
            .unwrap()
    }

    /// site/ -> hello.txt, docs/ -> readme.md
    fn site(&self) -> (Cid, Cid, Cid) {
        let hello = self.builder.add_file(b"hello world").unwrap();
        let readme = self.builder.add_chunked_file(b"# readme\nsecond line\n", 5).unwrap();
        let docs = self
            .builder
            .add_directory(&[("readme.md".to_string(), readme)])
            .unwrap();
        let site = self
            .builder
            .add_directory(&[("hello.txt".to_string(), hello), ("docs".to_string(), docs)])
            .unwrap();
        (site, hello, readme)
    }
}

async fn body(response: GatewayResponse) -> Bytes {
    response.into_bytes().await.unwrap()
}

#[tokio::test]
async fn test_directory_as_car_via_accept() {
    let fixture = Fixture::new();
    let (site, hello, readme) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(
            format!("/ipfs/{}", site),
            RequestOptions::get().with_header("accept", "application/vnd.ipld.car"),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(
        response.content_type(),
        Some("application/vnd.ipld.car; version=1")
    );
    let disposition = response.header("content-disposition").unwrap().to_string();
    assert!(disposition.contains(&format!("attachment; filename=\"{}.car\"", site)));
    assert!(response.header("etag").unwrap().starts_with("W/"));

    let bytes = body(response).await;
    let mut reader = CarReader::new(Cursor::new(bytes.to_vec())).await.unwrap();
    assert_eq!(reader.header().roots(), &[site]);
    let mut blocks = Vec::new();
    while let Some((cid, _)) = reader.next_block().await.unwrap() {
        blocks.push(cid);
    }
    assert_eq!(blocks[0], site);
    assert!(blocks.contains(&hello));
    assert!(blocks.contains(&readme));
}

#[tokio::test]
async fn test_suffix_range_on_small_file() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(
            format!("/ipfs/{}/hello.txt", site),
            RequestOptions::get().with_header("range", "bytes=-9"),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 206);
    assert_eq!(response.header("content-range"), Some("bytes 2-10/11"));
    assert_eq!(response.header("content-length"), Some("9"));
    assert_eq!(&body(response).await[..], b"llo world");
}

#[tokio::test]
async fn test_unsatisfiable_and_invalid_ranges() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    for range in ["bytes=20-30", "bytes=abc", "bytes=0-1,4-5"] {
        let response = gateway
            .fetch(
                format!("/ipfs/{}/hello.txt", site),
                RequestOptions::get().with_header("range", range),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 416, "range {}", range);
    }
}

#[tokio::test]
async fn test_range_across_chunked_file() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(
            format!("/ipfs/{}/docs/readme.md", site),
            RequestOptions::get().with_header("range", "bytes=3-12"),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 206);
    let etag = response.header("etag").unwrap().to_string();
    assert!(etag.ends_with(".3-12\""));
    assert_eq!(&body(response).await[..], b"eadme\nseco");
}

#[tokio::test]
async fn test_strong_etag_is_deterministic() {
    let fixture = Fixture::new();
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), Ipld::String("gateway".to_string()));
    let doc = fixture.builder.add_dag_json(&Ipld::Map(map)).unwrap();
    let gateway = fixture.gateway();

    let first = gateway
        .fetch(format!("/ipfs/{}", doc), RequestOptions::get())
        .await
        .unwrap();
    let second = gateway
        .fetch(format!("/ipfs/{}", doc), RequestOptions::get())
        .await
        .unwrap();

    assert_eq!(first.status, 200);
    assert_eq!(first.content_type(), Some("application/vnd.ipld.dag-json"));
    let etag = first.header("etag").unwrap().to_string();
    assert!(!etag.starts_with("W/"));
    assert_eq!(Some(etag.as_str()), second.header("etag"));
    assert!(first
        .header("cache-control")
        .unwrap()
        .contains("immutable"));
}

#[tokio::test]
async fn test_transcode_dag_json_to_dag_cbor() {
    let fixture = Fixture::new();
    let mut map = BTreeMap::new();
    map.insert("n".to_string(), Ipld::Integer(7));
    let doc = fixture.builder.add_dag_json(&Ipld::Map(map.clone())).unwrap();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}?format=dag-cbor", doc), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("application/vnd.ipld.dag-cbor"));
    assert!(response
        .header("content-disposition")
        .unwrap()
        .starts_with("inline"));
    let bytes = body(response).await;
    let decoded: Ipld = DagCborCodec.decode(&bytes).unwrap();
    assert_eq!(decoded, Ipld::Map(map));
}

#[tokio::test]
async fn test_plain_json_document() {
    let fixture = Fixture::new();
    let doc = fixture
        .builder
        .add_json(&serde_json::json!({"greeting": "hello", "count": 2}))
        .unwrap();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}", doc), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("application/json"));
    let value: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(value["greeting"], "hello");
}

#[tokio::test]
async fn test_plain_json_of_linked_node_is_not_representable() {
    let fixture = Fixture::new();
    let leaf = fixture.builder.add_raw(b"leaf");
    let mut map = BTreeMap::new();
    map.insert("leaf".to_string(), Ipld::Link(leaf));
    let doc = fixture.builder.add_dag_cbor(&Ipld::Map(map)).unwrap();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}?format=json", doc), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 406);
}

#[tokio::test]
async fn test_roots_header_ends_with_terminal() {
    let fixture = Fixture::new();
    let (site, _, readme) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}/docs/readme.md", site), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    let roots: Vec<String> = response
        .header("x-ipfs-roots")
        .unwrap()
        .split(',')
        .map(str::to_string)
        .collect();
    assert_eq!(roots.len(), 3);
    assert_eq!(roots.first(), Some(&site.to_string()));
    assert_eq!(roots.last(), Some(&readme.to_string()));
    assert_eq!(
        response.header("x-ipfs-path"),
        Some(format!("/ipfs/{}/docs/readme.md", site).as_str())
    );
}

#[tokio::test]
async fn test_missing_path_is_404_json() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}/nope.txt", site), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.content_type(), Some("application/json"));
    let error: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(error["error"], "path-not-found");
}

#[tokio::test]
async fn test_missing_block_offline_is_502() {
    let fixture = Fixture::new();
    let absent = trustless_gateway::store::cid_for(b"never stored", codecs::RAW);
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}", absent), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn test_invalid_resource_is_400() {
    let gateway = Fixture::new().gateway();
    let response = gateway
        .fetch("/ipfs/not-a-cid", RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_directory_listing_without_index() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}/", site), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));
    assert!(response.header("etag").unwrap().starts_with("W/\"DirIndex-"));
    let html = String::from_utf8(body(response).await.to_vec()).unwrap();
    assert!(html.contains("hello.txt"));
    assert!(html.contains("docs"));
}

#[tokio::test]
async fn test_directory_serves_index_html() {
    let fixture = Fixture::new();
    let index = fixture.builder.add_file(b"<h1>home</h1>").unwrap();
    let dir = fixture
        .builder
        .add_directory(&[("index.html".to_string(), index)])
        .unwrap();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}/", dir), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));
    assert_eq!(&body(response).await[..], b"<h1>home</h1>");
}

#[tokio::test]
async fn test_accept_mismatch_is_406() {
    let fixture = Fixture::new();
    let index = fixture.builder.add_file(b"<h1>home</h1>").unwrap();
    let dir = fixture
        .builder
        .add_directory(&[("index.html".to_string(), index)])
        .unwrap();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(
            format!("/ipfs/{}/", dir),
            RequestOptions::get().with_header("accept", "image/png"),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 406);
}

#[tokio::test]
async fn test_zero_quality_accept_excludes_html() {
    let fixture = Fixture::new();
    let index = fixture.builder.add_file(b"<h1>home</h1>").unwrap();
    let notes = fixture.builder.add_file(b"plain notes").unwrap();
    let dir = fixture
        .builder
        .add_directory(&[
            ("index.html".to_string(), index),
            ("notes.txt".to_string(), notes),
        ])
        .unwrap();
    let gateway = fixture.gateway();
    let accept = "text/html;q=0, */*";

    let html = gateway
        .fetch(
            format!("/ipfs/{}/index.html", dir),
            RequestOptions::get().with_header("accept", accept),
        )
        .await
        .unwrap();
    assert_eq!(html.status, 406);

    let text = gateway
        .fetch(
            format!("/ipfs/{}/notes.txt", dir),
            RequestOptions::get().with_header("accept", accept),
        )
        .await
        .unwrap();
    assert_eq!(text.status, 200);
}

#[tokio::test]
async fn test_if_none_match_and_head() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();
    let resource = format!("/ipfs/{}/hello.txt", site);

    let first = gateway
        .fetch(resource.clone(), RequestOptions::get())
        .await
        .unwrap();
    let etag = first.header("etag").unwrap().to_string();

    let cached = gateway
        .fetch(
            resource.clone(),
            RequestOptions::get().with_header("if-none-match", &etag),
        )
        .await
        .unwrap();
    assert_eq!(cached.status, 304);
    assert_eq!(cached.header("etag"), Some(etag.as_str()));
    assert!(body(cached).await.is_empty());

    let head = gateway.fetch(resource, RequestOptions::head()).await.unwrap();
    assert_eq!(head.status, 200);
    assert_eq!(head.header("content-length"), Some("11"));
    assert!(body(head).await.is_empty());
}

#[tokio::test]
async fn test_tar_export_of_directory() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(format!("/ipfs/{}?format=tar", site), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("application/x-tar"));
    assert_eq!(
        response.header("content-disposition"),
        Some(format!("attachment; filename=\"{}.tar\"", site).as_str())
    );

    let bytes = body(response).await;
    let mut archive = tar::Archive::new(&bytes[..]);
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&format!("{}/hello.txt", site)));
    assert!(names.contains(&format!("{}/docs/readme.md", site)));
}

#[tokio::test]
async fn test_tar_export_rejects_escaping_entry_name() {
    let fixture = Fixture::new();
    let file = fixture.builder.add_file(b"outside").unwrap();
    let inner = fixture
        .builder
        .add_directory(&[("..".to_string(), file)])
        .unwrap();
    let root = fixture
        .builder
        .add_directory(&[("nested".to_string(), inner)])
        .unwrap();
    let gateway = fixture.gateway();

    for cid in [inner, root] {
        let response = gateway
            .fetch(format!("/ipfs/{}?format=tar", cid), RequestOptions::get())
            .await
            .unwrap();
        assert_eq!(response.status, 406);
        assert_ne!(response.content_type(), Some("application/x-tar"));
    }
}

#[tokio::test]
async fn test_filename_and_download_query() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    let response = gateway
        .fetch(
            format!("/ipfs/{}/hello.txt?filename=greeting.txt&download=true", site),
            RequestOptions::get(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.header("content-disposition"),
        Some("attachment; filename=\"greeting.txt\"")
    );
}

#[tokio::test]
async fn test_mutable_name_is_weak_with_ttl() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let mut names = StaticNameResolver::new();
    names.insert(
        "example.org",
        &format!("/ipfs/{}", site),
        Some(Duration::from_secs(42)),
    );
    let gateway = Gateway::builder(GatewayConfig::offline())
        .with_store(fixture.store.clone())
        .with_resolver(Arc::new(names))
        .build()
        .unwrap();

    let response = gateway
        .fetch("/ipns/example.org/hello.txt", RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.header("etag").unwrap().starts_with("W/"));
    assert_eq!(response.header("cache-control"), Some("public, max-age=42"));
    assert_eq!(response.header("x-ipfs-path"), Some("/ipns/example.org/hello.txt"));
    assert_eq!(&body(response).await[..], b"hello world");
}

struct RecordResolver {
    target: String,
}

#[async_trait]
impl NameResolver for RecordResolver {
    async fn resolve(&self, _name: &str, _options: &ResolveOptions) -> Result<ResolvedName> {
        Ok(ResolvedName {
            path: self.target.clone(),
            ttl: None,
        })
    }

    async fn fetch_record(&self, _name: &str, _options: &ResolveOptions) -> Result<Bytes> {
        Ok(Bytes::from_static(b"signed-record"))
    }
}

#[tokio::test]
async fn test_ipns_record_export() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = Gateway::builder(GatewayConfig::offline())
        .with_store(fixture.store.clone())
        .with_resolver(Arc::new(RecordResolver {
            target: format!("/ipfs/{}", site),
        }))
        .build()
        .unwrap();

    let response = gateway
        .fetch("/ipns/example.org?format=ipns-record", RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("application/vnd.ipfs.ipns-record"));
    assert_eq!(
        response.header("content-disposition"),
        Some("attachment; filename=\"example.org.ipns-record\"")
    );
    assert_eq!(&body(response).await[..], b"signed-record");

    let immutable = gateway
        .fetch(format!("/ipfs/{}?format=ipns-record", site), RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(immutable.status, 400);
}

struct HangingStore;

#[async_trait]
impl BlockStore for HangingStore {
    async fn get(&self, _cid: &Cid, _options: &FetchOptions) -> Result<Bytes> {
        futures::future::pending().await
    }
}

struct HangingResolver;

#[async_trait]
impl NameResolver for HangingResolver {
    async fn resolve(&self, _name: &str, _options: &ResolveOptions) -> Result<ResolvedName> {
        futures::future::pending().await
    }
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn test_abort_during_resolution_carries_diagnostics() {
    let gateway = Gateway::builder(GatewayConfig::offline())
        .with_store(Arc::new(MemoryBlockStore::new()))
        .with_resolver(Arc::new(HangingResolver))
        .build()
        .unwrap();

    let cancel = cancel_after(Duration::from_millis(50));
    let result = gateway
        .fetch(
            "/ipns/example.org/index.html",
            RequestOptions::get().with_cancel(cancel),
        )
        .await;

    match result {
        Err(GatewayError::Aborted(diagnostics)) => {
            assert_eq!(diagnostics.stage, "resolve");
            assert!(diagnostics.elapsed >= Duration::from_millis(50));
            assert!(diagnostics.timings.iter().any(|t| t.name == "parse"));
        }
        other => panic!("expected an abort, got {:?}", other.map(|r| r.status)),
    }
}

#[tokio::test]
async fn test_abort_during_block_fetch() {
    let cid = trustless_gateway::store::cid_for(b"slow", codecs::RAW);
    let gateway = Gateway::builder(GatewayConfig::offline())
        .with_store(Arc::new(HangingStore))
        .build()
        .unwrap();

    let cancel = cancel_after(Duration::from_millis(20));
    let result = gateway
        .fetch(format!("/ipfs/{}", cid), RequestOptions::get().with_cancel(cancel))
        .await;

    match result {
        Err(GatewayError::Aborted(diagnostics)) => {
            assert_ne!(diagnostics.stage, "");
            assert!(diagnostics.timings.iter().any(|t| t.name == "render"));
        }
        other => panic!("expected an abort, got {:?}", other.map(|r| r.status)),
    }
}

#[tokio::test]
async fn test_server_timing_when_enabled() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let config = GatewayConfig {
        server_timing: true,
        ..GatewayConfig::offline()
    };
    let gateway = Gateway::builder(config)
        .with_store(fixture.store.clone())
        .build()
        .unwrap();

    let response = gateway
        .fetch(format!("/ipfs/{}/hello.txt", site), RequestOptions::get())
        .await
        .unwrap();
    let timing = response.header("server-timing").unwrap();
    assert!(timing.contains("parse;dur="));
    assert!(timing.contains("walk;dur="));
    assert!(timing.contains("render;dur="));
}

#[tokio::test]
async fn test_metrics_count_responses() {
    let fixture = Fixture::new();
    let (site, _, _) = fixture.site();
    let gateway = fixture.gateway();

    gateway
        .fetch(format!("/ipfs/{}/hello.txt", site), RequestOptions::get())
        .await
        .unwrap();
    gateway
        .fetch(format!("/ipfs/{}/missing", site), RequestOptions::get())
        .await
        .unwrap();

    let text = gateway.metrics().unwrap().render().unwrap();
    assert!(text.contains("gateway_requests_total{status=\"200\"} 1"));
    assert!(text.contains("gateway_requests_total{status=\"404\"} 1"));
    assert!(text.contains("gateway_plugin_dispatch_total{plugin=\"dag-pb\"} 1"));
    assert!(text.contains("gateway_errors_total{kind=\"path-not-found\"} 1"));
}
