//! Background cache population tests.
//!
//! Exercises `CachePopulator` both standalone and through the `/relay` route's
//! `sid` parameter: artifact promotion, key validation, single-flight
//! deduplication, and cleanup after failed or timed-out attempts.

use std::time::Duration;

use axum::http::StatusCode;
use tempfile::TempDir;

use audio_relay::{CachePopulator, RelayServer, RelaySettings};

use upstream_fixture::{UpstreamFixture, UpstreamOptions, test_body, wait_for_file};

fn populator_for(settings: &RelaySettings) -> CachePopulator {
    CachePopulator::new(reqwest::Client::new(), settings)
}

#[tokio::test(flavor = "multi_thread")]
async fn ensure_cached_writes_complete_artifact() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);

    let body = test_body(1000);
    let upstream = UpstreamFixture::start(UpstreamOptions {
        body: body.clone(),
        ..Default::default()
    })
    .await;

    populator
        .ensure_cached(&upstream.url_for("30112233.m4s"), "30112233")
        .await;
    populator.close_and_wait().await;

    let artifact = settings.cache_dir().join("30112233.m4s");
    let written = tokio::fs::read(&artifact).await.expect("artifact exists");
    assert_eq!(written, body);
    assert!(!settings.cache_dir().join("30112233.m4s.part").exists());
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn populate_fetch_is_never_ranged() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);
    let upstream = UpstreamFixture::start(UpstreamOptions::default()).await;

    populator
        .ensure_cached(&upstream.url_for("track.m4s"), "track")
        .await;
    populator.close_and_wait().await;

    assert_eq!(upstream.ranges_seen().await, vec![None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_sid_triggers_background_populate() {
    let tmp = TempDir::new().unwrap();
    let server =
        RelayServer::new(RelaySettings::new(tmp.path()).port(0)).expect("create relay server");
    let addr = server.start().await.expect("start relay server");

    let body = test_body(1000);
    let upstream = UpstreamFixture::start(UpstreamOptions {
        body: body.clone(),
        ..Default::default()
    })
    .await;

    let upstream_url = upstream.url_for("30112233.m4s");
    let encoded: String =
        url::form_urlencoded::byte_serialize(upstream_url.as_bytes()).collect();
    let response = reqwest::Client::new()
        .get(format!("http://{}/relay?u={}&sid=30112233", addr, encoded))
        .send()
        .await
        .expect("relay request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap(), body);

    // The live response and the populate fetch are independent requests.
    let artifact = tmp.path().join("audio_cache").join("30112233.m4s");
    assert!(wait_for_file(&artifact, Duration::from_secs(5)).await);
    assert_eq!(upstream.hits(), 2);
    assert_eq!(tokio::fs::read(&artifact).await.unwrap(), body);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_and_unsafe_keys_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);
    let upstream = UpstreamFixture::start(UpstreamOptions::default()).await;

    let url = upstream.url_for("track.m4s");
    for key in ["", "..", "../../etc/evil", "a/b", "a\\b"] {
        populator.ensure_cached(&url, key).await;
    }
    populator.close_and_wait().await;

    assert_eq!(upstream.hits(), 0);
    assert!(!settings.cache_dir().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_artifact_skips_fetch() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    tokio::fs::create_dir_all(settings.cache_dir()).await.unwrap();
    tokio::fs::write(settings.cache_dir().join("track.m4s"), b"already here")
        .await
        .unwrap();

    let populator = populator_for(&settings);
    let upstream = UpstreamFixture::start(UpstreamOptions::default()).await;

    populator
        .ensure_cached(&upstream.url_for("track.m4s"), "track")
        .await;
    populator.close_and_wait().await;

    assert_eq!(upstream.hits(), 0);
    let contents = tokio::fs::read(settings.cache_dir().join("track.m4s"))
        .await
        .unwrap();
    assert_eq!(contents, b"already here");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_for_one_key_fetch_once() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);

    // Slow enough that re-triggers land while the first attempt is running.
    let upstream = UpstreamFixture::start(UpstreamOptions {
        chunk_delay: Duration::from_millis(30),
        ..Default::default()
    })
    .await;

    let url = upstream.url_for("track.m4s");
    for _ in 0..8 {
        populator.ensure_cached(&url, "track").await;
    }
    assert!(populator.is_in_flight("track").await);

    populator.close_and_wait().await;
    assert!(!populator.is_in_flight("track").await);
    assert_eq!(upstream.hits(), 1);
    assert!(settings.cache_dir().join("track.m4s").is_file());
    assert!(!settings.cache_dir().join("track.m4s.part").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn non_200_upstream_is_not_cached() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);
    let upstream = UpstreamFixture::start(UpstreamOptions {
        status: StatusCode::NOT_FOUND,
        ..Default::default()
    })
    .await;

    populator
        .ensure_cached(&upstream.url_for("track.m4s"), "track")
        .await;
    populator.close_and_wait().await;

    assert_eq!(upstream.hits(), 1);
    assert!(!settings.cache_dir().join("track.m4s").exists());
    assert!(!settings.cache_dir().join("track.m4s.part").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn midstream_failure_leaves_no_partial_artifact() {
    let tmp = TempDir::new().unwrap();
    let settings = RelaySettings::new(tmp.path());
    let populator = populator_for(&settings);
    let upstream = UpstreamFixture::start(UpstreamOptions {
        fail_after_bytes: Some(300),
        ..Default::default()
    })
    .await;

    populator
        .ensure_cached(&upstream.url_for("track.m4s"), "track")
        .await;
    populator.close_and_wait().await;

    assert!(!settings.cache_dir().join("track.m4s").exists());
    assert!(!settings.cache_dir().join("track.m4s.part").exists());

    // The key is released, so a later attempt can retry and succeed.
    let healthy = UpstreamFixture::start(UpstreamOptions::default()).await;
    populator
        .ensure_cached(&healthy.url_for("other.m4s"), "other")
        .await;
    populator.close_and_wait().await;
    assert!(settings.cache_dir().join("other.m4s").is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_upstream_hits_populate_timeout() {
    let tmp = TempDir::new().unwrap();
    let settings =
        RelaySettings::new(tmp.path()).populate_timeout(Duration::from_millis(100));
    let populator = populator_for(&settings);

    // 4 chunks at 80ms each cannot finish inside the 100ms budget.
    let upstream = UpstreamFixture::start(UpstreamOptions {
        chunk_delay: Duration::from_millis(80),
        ..Default::default()
    })
    .await;

    populator
        .ensure_cached(&upstream.url_for("track.m4s"), "track")
        .await;
    populator.close_and_wait().await;

    assert!(!settings.cache_dir().join("track.m4s").exists());
    assert!(!settings.cache_dir().join("track.m4s.part").exists());
    assert!(!populator.is_in_flight("track").await);
}
