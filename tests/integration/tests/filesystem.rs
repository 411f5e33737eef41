//! File system store scenarios: mirroring, scanning, watching.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{Interpolator, eventually, init_tracing};
use pretty_assertions::assert_eq;
use quill_core::{Compiler, CompilerOptions, DEBOUNCE_WINDOW, RenderTimePolicy};
use quill_store::{Content, FileSystemStore, FsStoreConfig, ModuleFormat, OpToken};
use serde_json::{Value, json};
use tempfile::TempDir;

fn site() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let partials = dir.path().join("partials");
    fs::create_dir_all(partials.join("layout")).unwrap();
    fs::write(dir.path().join("template.html"), "<title>{{title}}</title>").unwrap();
    fs::write(partials.join("header.html"), "<h1>{{title}}</h1>").unwrap();
    fs::write(partials.join("layout/footer.html"), "<footer/>").unwrap();
    dir
}

fn compiler(source: &Path, output: &Path, options: CompilerOptions) -> Compiler {
    let store = FileSystemStore::new(
        FsStoreConfig::new(source)
            .output_dir(output)
            .module_format(ModuleFormat::Esm),
        options.resolver().unwrap(),
    );
    Compiler::new(options, Arc::new(store), Arc::new(Interpolator::default()))
}

#[tokio::test]
async fn mirroring_twice_yields_the_same_tree() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let options = CompilerOptions::new();
    let store = FileSystemStore::new(
        FsStoreConfig::new(source.path()).output_dir(output.path()),
        options.resolver().unwrap(),
    );

    let first = store.mirror(&OpToken::new()).await.unwrap();
    let second = store.mirror(&OpToken::new()).await.unwrap();

    assert_eq!(first.directories, second.directories);
    assert!(output.path().join("partials/layout").is_dir());
}

#[tokio::test]
async fn scan_registers_every_partial() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let compiler = compiler(source.path(), output.path(), CompilerOptions::new());

    assert_eq!(compiler.scan().await.unwrap(), 3);
    assert_eq!(
        compiler.registry().names(),
        vec!["header", "layout/footer", "template"]
    );
    let out = compiler
        .render("header", &json!({"title": "Quill"}), &Value::Null)
        .await
        .unwrap();
    assert_eq!(out, "<h1>Quill</h1>");
}

#[tokio::test]
async fn scan_overrides_explicit_registration() {
    init_tracing();
    let source = site();
    fs::write(source.path().join("partials/foo.html"), "B").unwrap();
    let output = tempfile::tempdir().unwrap();
    let compiler = compiler(source.path(), output.path(), CompilerOptions::new());

    compiler.register_partial("foo", "A").unwrap();
    compiler.scan().await.unwrap();

    let record = compiler.get_registered("foo").unwrap();
    assert_eq!(record.content, Content::Text("B".to_string()));
    assert!(record.overridden);
}

#[tokio::test]
async fn compiled_code_is_persisted_with_module_wrapper() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let options = CompilerOptions {
        render_time_policy: RenderTimePolicy::ReadWrite,
        ..CompilerOptions::new()
    };
    let compiler = compiler(source.path(), output.path(), options);

    compiler.compile("header").await.unwrap();

    let written = fs::read_to_string(output.path().join("partials/header.html.compiled")).unwrap();
    assert_eq!(written, "export default <h1>{{title}}</h1>;\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_file_is_registered_within_window() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let compiler = compiler(source.path(), output.path(), CompilerOptions::new());
    compiler.watch().unwrap();
    assert_eq!(compiler.watching().len(), 1);

    fs::write(source.path().join("partials/watch-test.html"), "<p>new</p>").unwrap();

    let registered = eventually(DEBOUNCE_WINDOW * 10, || {
        compiler.get_registered("watch-test").is_some()
    })
    .await;
    assert!(registered);
    assert_eq!(
        compiler.get_registered("watch-test").unwrap().content,
        Content::Text("<p>new</p>".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_change_replaces_compiled_renderer() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let compiler = compiler(source.path(), output.path(), CompilerOptions::new());
    compiler.scan().await.unwrap();
    compiler.watch().unwrap();

    let before = compiler.render("header", &json!({"title": "x"}), &Value::Null).await.unwrap();
    assert_eq!(before, "<h1>x</h1>");

    fs::write(source.path().join("partials/header.html"), "<h2>{{title}}</h2>").unwrap();
    let changed = eventually(DEBOUNCE_WINDOW * 10, || {
        compiler
            .get_registered("header")
            .is_some_and(|r| r.content == Content::Text("<h2>{{title}}</h2>".to_string()))
    })
    .await;
    assert!(changed);

    let after = compiler.render("header", &json!({"title": "x"}), &Value::Null).await.unwrap();
    assert_eq!(after, "<h2>x</h2>");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_file_is_unregistered() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let compiler = compiler(source.path(), output.path(), CompilerOptions::new());
    compiler.scan().await.unwrap();
    compiler.watch().unwrap();

    fs::remove_file(source.path().join("partials/layout/footer.html")).unwrap();

    let removed = eventually(DEBOUNCE_WINDOW * 10, || {
        compiler.get_registered("layout/footer").is_none()
    })
    .await;
    assert!(removed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_closes_watchers_and_output() {
    init_tracing();
    let source = site();
    let output = tempfile::tempdir().unwrap();
    let out_dir = output.path().join("out");
    let compiler = compiler(source.path(), &out_dir, CompilerOptions::new());
    compiler.scan().await.unwrap();
    compiler.watch().unwrap();
    assert!(out_dir.is_dir());

    compiler.clear(false).await.unwrap();

    assert!(compiler.watching().is_empty());
    assert!(compiler.registry().is_empty());
    assert!(!out_dir.exists());

    fs::write(source.path().join("partials/after.html"), "x").unwrap();
    tokio::time::sleep(DEBOUNCE_WINDOW * 3).await;
    assert!(compiler.get_registered("after").is_none());
    // the store is usable again once cleared
    assert_eq!(compiler.scan().await.unwrap(), 4);
}
