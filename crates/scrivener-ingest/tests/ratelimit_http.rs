//! Rate-limit coordination exercised over real HTTP against a mock
//! upstream: backoff respect and cross-route bucket convergence.

mod common;

use std::time::Duration;

use common::test_rest_client;
use serde_json::json;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn second_request_waits_out_a_429() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/C1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"retry_after": 0.4, "global": false})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/C1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let rest = test_rest_client(&server.uri());
    let route = "GET:/channels/:channelId/messages";

    let first = rest
        .get("/channels/C1/messages?limit=100", route)
        .await
        .unwrap();
    assert_eq!(first.status, 429);
    assert_eq!(first.retry_after_ms(), 400);

    let started = Instant::now();
    let second = rest
        .get("/channels/C1/messages?limit=100", route)
        .await
        .unwrap();
    assert!(second.is_success());
    assert!(
        started.elapsed() >= Duration::from_millis(390),
        "bucket cooldown was not honored: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn tiny_retry_intervals_are_floored() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/channels/C2/messages"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({"retry_after": 0.01})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/C2/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let rest = test_rest_client(&server.uri());
    let route = "GET:/channels/:channelId/messages";

    let first = rest
        .get("/channels/C2/messages?limit=100", route)
        .await
        .unwrap();
    assert_eq!(first.status, 429);
    assert_eq!(first.retry_after_ms(), 250);

    let started = Instant::now();
    rest.get("/channels/C2/messages?limit=100", route)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(240));
}

#[tokio::test]
async fn exhausted_bucket_header_cools_the_next_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/guilds/G1/channels"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Remaining", "0")
                .insert_header("X-RateLimit-Reset-After", "0.4")
                .set_body_json(json!([])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/G1/channels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let rest = test_rest_client(&server.uri());
    let route = "GET:/guilds/:guildId/channels";

    let first = rest.get("/guilds/G1/channels", route).await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.exhausted_delay_ms(), Some(400));

    let started = Instant::now();
    rest.get("/guilds/G1/channels", route).await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(390),
        "reset-after cooldown was not honored: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn routes_learn_a_shared_bucket_over_http() {
    let server = MockServer::start().await;

    // Both endpoint shapes report the same bucket id; the second route's
    // 429 cooldown must therefore stall the first route too.
    Mock::given(method("GET"))
        .and(path("/users/@me/guilds"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Bucket", "shared-bucket")
                .set_body_json(json!([])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/G1/channels"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("X-RateLimit-Bucket", "shared-bucket")
                .set_body_json(json!({"retry_after": 0.4})),
        )
        .mount(&server)
        .await;

    let rest = test_rest_client(&server.uri());

    rest.get("/users/@me/guilds?limit=200", "GET:/users/@me/guilds")
        .await
        .unwrap();
    let limited = rest
        .get("/guilds/G1/channels", "GET:/guilds/:guildId/channels")
        .await
        .unwrap();
    assert_eq!(limited.status, 429);

    // The guild-list route now resolves to the same cooled-down bucket.
    let started = Instant::now();
    rest.get("/users/@me/guilds?limit=200", "GET:/users/@me/guilds")
        .await
        .unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(390),
        "shared bucket cooldown was not honored: {:?}",
        started.elapsed()
    );
}
