//! Compiling against the key/value store.

mod common;

use std::sync::Arc;

use common::{Interpolator, init_tracing};
use pretty_assertions::assert_eq;
use quill_core::{CompileRequest, Compiler, CompilerOptions, QuillError, RenderTimePolicy};
use quill_store::kv::{CODE_COLLECTION, CONTENT_COLLECTION};
use quill_store::{EmbeddedKv, KeyValueStore, KvEngine, Lookup, OpToken, Store, StoreError};
use serde_json::{Value, json};

fn compiler(engine: &Arc<EmbeddedKv>, options: CompilerOptions) -> Compiler {
    let store = KeyValueStore::new(engine.clone(), options.resolver().unwrap()).with_page_size(2);
    Compiler::new(options, Arc::new(store), Arc::new(Interpolator::default()))
}

fn read_write() -> CompilerOptions {
    CompilerOptions {
        render_time_policy: RenderTimePolicy::ReadWrite,
        ..CompilerOptions::new()
    }
}

#[tokio::test]
async fn compiled_code_is_shared_between_instances() {
    init_tracing();
    let engine = Arc::new(EmbeddedKv::new());

    let first = compiler(&engine, read_write());
    first
        .compile_with(CompileRequest::new("card").with_content("[{{title}}]"))
        .await
        .unwrap();
    assert_eq!(engine.len(CODE_COLLECTION), 1);

    let second = compiler(&engine, read_write());
    let out = second
        .render("card", &json!({"title": "t"}), &Value::Null)
        .await
        .unwrap();
    assert_eq!(out, "[t]");
}

#[tokio::test]
async fn scan_registers_good_documents_despite_failures() {
    init_tracing();
    let engine = Arc::new(EmbeddedKv::new());
    let writer = compiler(&engine, read_write());
    for name in ["alpha", "beta", "gamma"] {
        writer
            .store()
            .write_content(Lookup::name(name), format!("<{name}/>").into(), &OpToken::new())
            .await
            .unwrap();
    }
    engine
        .put(CONTENT_COLLECTION, "partials/broken.html", b"{".to_vec())
        .await
        .unwrap();

    let reader = compiler(&engine, CompilerOptions::new());
    let err = reader.scan().await.unwrap_err();

    assert!(matches!(err, QuillError::Store(StoreError::Batch(_))));
    assert_eq!(reader.registry().names(), vec!["alpha", "beta", "gamma"]);
    let out = reader.render("beta", &Value::Null, &Value::Null).await.unwrap();
    assert_eq!(out, "<beta/>");
}

#[tokio::test]
async fn clear_all_empties_both_collections() {
    init_tracing();
    let engine = Arc::new(EmbeddedKv::new());
    let compiler = compiler(&engine, read_write());
    for name in ["one", "two", "three"] {
        compiler
            .compile_with(CompileRequest::new(name).with_content(name))
            .await
            .unwrap();
    }
    compiler
        .store()
        .write_content(Lookup::name("one"), "one".into(), &OpToken::new())
        .await
        .unwrap();
    assert_eq!(engine.len(CODE_COLLECTION), 3);

    compiler.clear(true).await.unwrap();

    assert!(engine.is_empty(CODE_COLLECTION));
    assert!(engine.is_empty(CONTENT_COLLECTION));
    assert!(compiler.registry().is_empty());
}
