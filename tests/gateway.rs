//! End-to-end: RemoteClient -> gateway -> GcsClient -> fake Cloud Storage.

mod common;

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

use common::{start_fake_gcs, start_gateway, write_key, FakeGcs, DOWN_BUCKET, READ_ONLY_TOKEN};
use storegate::auth::SigningScheme;
use storegate::channel::{ChannelConfig, ChannelConfigMap};
use storegate::errors::StorageError;
use storegate::factory::ClientFactory;
use storegate::remote::RemoteClient;
use storegate::storage::backend::{Authorization, ByteStream, ObjectStorage};

struct Harness {
    gcs: FakeGcs,
    gateway: String,
    channels: ChannelConfigMap,
    _keys: TempDir,
    cache: TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(SigningScheme::V2).await
    }

    async fn start_with(scheme: SigningScheme) -> Self {
        let gcs = start_fake_gcs().await;
        let keys = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let key = write_key(keys.path(), "key.json", &gcs.token_uri());

        let channels: ChannelConfigMap = [
            ("tenant1".to_string(), ChannelConfig::local(&key, "b1")),
            ("tenant2".to_string(), ChannelConfig::local(&key, "b2")),
            (
                "public".to_string(),
                ChannelConfig::local(&key, "public-bucket"),
            ),
            ("down".to_string(), ChannelConfig::local(&key, DOWN_BUCKET)),
            (
                "fetched".to_string(),
                ChannelConfig::remote(gcs.key_url(), "b3"),
            ),
        ]
        .into_iter()
        .collect();
        gcs.state.make_public("public-bucket");

        let gateway = start_gateway(
            channels.clone(),
            common::factory(&gcs, cache.path(), scheme),
        )
        .await;

        Self {
            gcs,
            gateway,
            channels,
            _keys: keys,
            cache,
        }
    }

    fn client(&self, channel: &str) -> RemoteClient {
        RemoteClient::new(&self.gateway, channel).unwrap()
    }
}

#[tokio::test]
async fn test_tenants_see_only_their_own_bucket() {
    let h = Harness::start().await;
    let tenant1 = h.client("tenant1");
    let tenant2 = h.client("tenant2");

    let path = tenant1.save("a.txt", Bytes::from_static(b"hi")).await.unwrap();
    assert_eq!(path, "a.txt");

    match tenant2.get("a.txt").await {
        Err(StorageError::NotFound { key }) => assert_eq!(key, "a.txt"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(tenant1.get("a.txt").await.unwrap(), "hi");

    assert_eq!(h.gcs.state.object("b1", "a.txt").unwrap(), "hi");
    assert!(h.gcs.state.object("b2", "a.txt").is_none());
}

#[tokio::test]
async fn test_colliding_keys_land_in_separate_buckets() {
    let h = Harness::start().await;
    h.client("tenant1")
        .save("same.txt", Bytes::from_static(b"one"))
        .await
        .unwrap();
    h.client("tenant2")
        .save("same.txt", Bytes::from_static(b"two"))
        .await
        .unwrap();

    assert_eq!(h.client("tenant1").get("same.txt").await.unwrap(), "one");
    assert_eq!(h.client("tenant2").get("same.txt").await.unwrap(), "two");
}

#[tokio::test]
async fn test_exists_lifecycle() {
    let h = Harness::start().await;
    let client = h.client("tenant1");

    assert!(!client.exists("dir/k.bin").await.unwrap());
    client
        .save("dir/k.bin", Bytes::from_static(b"\x00\x01\x02"))
        .await
        .unwrap();
    assert!(client.exists("dir/k.bin").await.unwrap());
    assert_eq!(client.get("dir/k.bin").await.unwrap(), &b"\x00\x01\x02"[..]);

    client.delete("dir/k.bin").await.unwrap();
    assert!(!client.exists("dir/k.bin").await.unwrap());

    assert!(matches!(
        client.delete("dir/k.bin").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_save_by_stream_through_gateway() {
    let h = Harness::start().await;
    let client = h.client("tenant1");

    let chunks: ByteStream = Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"streamed ")),
        Ok(Bytes::from_static(b"world")),
    ]));
    client.save_by_stream("big.txt", chunks).await.unwrap();
    assert_eq!(
        client.get("big.txt").await.unwrap(),
        "hello streamed world"
    );
}

#[tokio::test]
async fn test_list_drops_markers_and_follows_pages() {
    let h = Harness::start().await;
    let client = h.client("tenant1");

    for key in [
        "photos/a.png",
        "photos/b.png",
        "photos/c.png",
        "photos/2024/d.png",
        "docs/e.txt",
    ] {
        client.save(key, Bytes::from_static(b"x")).await.unwrap();
    }
    h.gcs.state.put("b1", "photos/", b"");
    h.gcs.state.put("b1", "photos/2024/", b"");

    let files = client.list("photos/").await.unwrap();
    assert_eq!(
        files,
        vec![
            "photos/2024/d.png",
            "photos/a.png",
            "photos/b.png",
            "photos/c.png"
        ]
    );
    assert!(client.list("nothing/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_download_url_public_and_private() {
    let h = Harness::start().await;
    h.gcs.state.put("public-bucket", "open file.txt", b"x");
    h.gcs.state.put("b1", "secret.txt", b"x");

    let public = h.client("public").download_url("open file.txt").await.unwrap();
    assert!(public.is_public());
    assert!(public.access_token().is_none());
    assert_eq!(
        public.url(),
        format!("{}/public-bucket/open%20file.txt", h.gcs.base)
    );

    let private = h.client("tenant1").download_url("secret.txt").await.unwrap();
    assert!(!private.is_public());
    let token = private.access_token().unwrap();
    assert_eq!(token.access_token, READ_ONLY_TOKEN);
    assert_eq!(token.token_type, "Bearer");
    assert!(token.refresh_token.is_empty());

    assert!(h.client("public").is_public().await.unwrap());
    assert!(!h.client("tenant1").is_public().await.unwrap());
}

#[tokio::test]
async fn test_download_url_of_missing_object_is_not_found() {
    let h = Harness::start().await;
    let err = h.client("tenant1").download_url("ghost.txt").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_access_token_is_read_only() {
    let h = Harness::start().await;
    let token = h.client("tenant2").access_token().await.unwrap();
    assert_eq!(token.access_token, READ_ONLY_TOKEN);
    assert!(token.expiry > chrono::Utc::now());
}

#[tokio::test]
async fn test_signed_url_expiry() {
    let h = Harness::start().await;
    let client = h.client("tenant1");

    let before = chrono::Utc::now().timestamp();
    let url = client
        .signed_url("up/load.bin", "application/octet-stream", Duration::from_secs(900))
        .await
        .unwrap();
    let after = chrono::Utc::now().timestamp();

    let parsed = reqwest::Url::parse(&url).unwrap();
    assert_eq!(parsed.path(), "/b1/up/load.bin");
    let expires: i64 = parsed
        .query_pairs()
        .find(|(k, _)| k == "Expires")
        .map(|(_, v)| v.parse().unwrap())
        .unwrap();
    assert!(expires >= before + 900 && expires <= after + 900);

    let err = client
        .signed_url("up/load.bin", "application/octet-stream", Duration::from_secs(0))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument { .. }));
}

#[tokio::test]
async fn test_signed_url_v4() {
    let h = Harness::start_with(SigningScheme::V4).await;
    let url = h
        .client("tenant1")
        .signed_url("a.txt", "text/plain", Duration::from_secs(60))
        .await
        .unwrap();
    let parsed = reqwest::Url::parse(&url).unwrap();
    let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
    assert_eq!(params["X-Goog-Algorithm"], "GOOG4-RSA-SHA256");
    assert_eq!(params["X-Goog-Expires"], "60");
    assert!(params.contains_key("X-Goog-Signature"));
}

#[tokio::test]
async fn test_unknown_channel_is_invalid_argument() {
    let h = Harness::start().await;
    match h.client("nobody").exists("a.txt").await {
        Err(StorageError::InvalidArgument { message }) => {
            assert_eq!(message, "channel not found [nobody]")
        }
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remote_errors_match_in_process_errors() {
    let h = Harness::start().await;
    let factory = common::factory(&h.gcs, h.cache.path(), SigningScheme::V2);

    for (channel, key) in [("tenant1", "missing.txt"), ("down", "a.txt")] {
        let config = h.channels.resolve(channel).unwrap();
        let local = factory.build(config).await.unwrap();
        let remote = h.client(channel);

        let local_err = local.get(key).await.unwrap_err();
        let remote_err = remote.get(key).await.unwrap_err();
        assert_eq!(local_err.code(), remote_err.code(), "channel {channel}");

        let local_list = local.list("").await.map_err(|e| e.code());
        let remote_list = remote.list("").await.map_err(|e| e.code());
        assert_eq!(local_list, remote_list, "channel {channel}");
    }
}

#[tokio::test]
async fn test_remote_credentials_fetched_once() {
    let h = Harness::start().await;
    let client = h.client("fetched");

    client.save("x.txt", Bytes::from_static(b"1")).await.unwrap();
    client.save("y.txt", Bytes::from_static(b"2")).await.unwrap();
    assert!(client.exists("x.txt").await.unwrap());

    assert_eq!(h.gcs.state.key_downloads.load(Ordering::SeqCst), 1);
    assert_eq!(h.gcs.state.object("b3", "y.txt").unwrap(), "2");
}

#[tokio::test]
async fn test_missing_key_file_is_credential_error() {
    let h = Harness::start().await;
    let channels: ChannelConfigMap = [(
        "broken".to_string(),
        ChannelConfig::local("/no/such/key.json", "b1"),
    )]
    .into_iter()
    .collect();
    let gateway = start_gateway(
        channels,
        common::factory(&h.gcs, h.cache.path(), SigningScheme::V2),
    )
    .await;

    let err = RemoteClient::new(gateway, "broken")
        .unwrap()
        .exists("a.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Credential(_)));
}

#[tokio::test]
async fn test_backend_outage_is_backend_unavailable() {
    let h = Harness::start().await;
    let err = h
        .client("down")
        .save("a.txt", Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable(_)));
}
