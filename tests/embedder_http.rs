//! HTTP embedder against a mock endpoint: batching, ordering, retry.

use std::sync::Arc;

use serde_json::json;
use skilld::config::EmbedderConfig;
use skilld::embed::{Embedder, HttpEmbedder};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(endpoint: String, max_retries: usize) -> EmbedderConfig {
    EmbedderConfig {
        endpoint: Some(endpoint),
        model: Some("test-embedder".into()),
        api_key: None,
        max_retries,
    }
}

#[tokio::test]
async fn batch_preserves_input_order() {
    let server = MockServer::start().await;
    // The provider answers out of order; `index` must restore it.
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": [1.0, 1.0]},
                {"index": 0, "embedding": [0.0, 0.0]},
            ]
        })))
        .mount(&server)
        .await;

    let cfg = config(format!("{}/embeddings", server.uri()), 1);
    let embedder = Arc::new(
        tokio::task::spawn_blocking(move || HttpEmbedder::new(&cfg, None))
            .await
            .unwrap()
            .unwrap(),
    );
    let result = tokio::task::spawn_blocking({
        let embedder = Arc::clone(&embedder);
        move || embedder.embed_batch(&["first".into(), "second".into()])
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result[0], vec![0.0, 0.0]);
    assert_eq!(result[1], vec![1.0, 1.0]);
    assert_eq!(embedder.dimension(), Some(2));
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let server = MockServer::start().await;
    // First attempt fails, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.5]}]
        })))
        .mount(&server)
        .await;

    let cfg = config(format!("{}/embeddings", server.uri()), 3);
    let embedder = tokio::task::spawn_blocking(move || HttpEmbedder::new(&cfg, None))
        .await
        .unwrap()
        .unwrap();
    let result = tokio::task::spawn_blocking(move || embedder.embed("hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, vec![0.5]);
}

#[tokio::test]
async fn exhausted_retries_surface_embedder_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let cfg = config(format!("{}/embeddings", server.uri()), 2);
    let embedder = tokio::task::spawn_blocking(move || HttpEmbedder::new(&cfg, None))
        .await
        .unwrap()
        .unwrap();
    let err = tokio::task::spawn_blocking(move || embedder.embed("hello"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), "embedder_unavailable");
}

#[tokio::test]
async fn request_carries_model_and_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({
            "model": "test-embedder",
            "input": ["one text"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1, 0.2]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cfg = config(format!("{}/embeddings", server.uri()), 1);
    let embedder = tokio::task::spawn_blocking(move || HttpEmbedder::new(&cfg, None))
        .await
        .unwrap()
        .unwrap();
    tokio::task::spawn_blocking(move || embedder.embed("one text"))
        .await
        .unwrap()
        .unwrap();
}
