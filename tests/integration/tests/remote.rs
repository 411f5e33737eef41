//! Compiling against a remote HTTP store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Interpolator, init_tracing};
use pretty_assertions::assert_eq;
use quill_core::{Compiler, CompilerOptions, QuillError, RenderTimePolicy};
use quill_remote::{HttpClient, RemoteStore};
use serde_json::{Value, json};
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn compiler(server: &MockServer, options: CompilerOptions) -> (Compiler, Arc<Interpolator>) {
    let client = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let store = RemoteStore::new(
        &format!("{}/site", server.uri()),
        client,
        options.resolver().unwrap(),
    )
    .unwrap();
    let generator = Arc::new(Interpolator::default());
    (
        Compiler::new(options, Arc::new(store), generator.clone()),
        generator,
    )
}

#[tokio::test]
async fn renders_content_fetched_over_http() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/partials/greeting.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Hello {{who}}"))
        .expect(1)
        .mount(&server)
        .await;

    let (compiler, generator) = compiler(&server, CompilerOptions::new());

    for _ in 0..3 {
        let out = compiler
            .render("greeting", &json!({"who": "world"}), &Value::Null)
            .await
            .unwrap();
        assert_eq!(out, "Hello world");
    }
    assert_eq!(generator.calls(), 1);
    assert!(compiler.get_registered("greeting").is_some());
}

#[tokio::test]
async fn read_write_policy_posts_compiled_source() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/partials/nav.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<nav>{{page}}</nav>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/site/partials/nav.html.compiled"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string(
            "name=nav&renderer=%3Cnav%3E%7B%7Bpage%7D%7D%3C%2Fnav%3E",
        ))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let options = CompilerOptions {
        render_time_policy: RenderTimePolicy::ReadWrite,
        ..CompilerOptions::new()
    };
    let (compiler, _) = compiler(&server, options);

    let record = compiler.compile("nav").await.unwrap();
    assert_eq!(record.short_name, "nav");
    assert_eq!(
        record.render(&json!({"page": "home"}), &Value::Null).unwrap(),
        "<nav>home</nav>"
    );
}

#[tokio::test]
async fn stored_code_is_materialized_instead_of_compiled() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/partials/cached.html.compiled"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from {{origin}}"))
        .mount(&server)
        .await;

    let (compiler, generator) = compiler(&server, CompilerOptions::new());

    let out = compiler
        .render("cached", &json!({"origin": "store"}), &Value::Null)
        .await
        .unwrap();
    assert_eq!(out, "from store");
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn server_errors_name_the_partial() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/site/partials/broken.html"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (compiler, _) = compiler(&server, CompilerOptions::new());

    let err = compiler.compile("broken").await.unwrap_err();
    match err {
        QuillError::StoreFor { name, key, source } => {
            assert_eq!(name, "broken");
            assert_eq!(key, "partials/broken.html");
            assert_eq!(source.http_status(), Some(500));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_content_is_reported_with_policy() {
    init_tracing();
    let server = MockServer::start().await;

    let (compiler, _) = compiler(&server, CompilerOptions::new());

    let err = compiler.compile("absent").await.unwrap_err();
    assert!(matches!(
        err,
        QuillError::ContentNotFound {
            policy: RenderTimePolicy::Read,
            ..
        }
    ));
}
