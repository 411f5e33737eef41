//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quill_core::{GenerateError, Generator};
use quill_store::{Content, RenderError, Renderer};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("quill_core=debug,quill_store=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Renderer substituting `{{key}}` with context values.
struct Interpolate(String);

impl Renderer for Interpolate {
    fn render(&self, context: &Value, _options: &Value) -> Result<String, RenderError> {
        let mut out = String::new();
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| RenderError::new("unterminated placeholder"))?;
            if let Some(value) = context.get(after[..end].trim()) {
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn source(&self) -> Option<&str> {
        Some(&self.0)
    }
}

/// Generator used by every scenario; counts its invocations.
#[derive(Default)]
pub struct Interpolator {
    calls: AtomicUsize,
}

impl Interpolator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Generator for Interpolator {
    fn generate(&self, content: &Content, _options: &Value) -> Result<Arc<dyn Renderer>, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = content.as_text();
        if text.contains("{{#") {
            return Err(GenerateError::new("block helpers are not supported"));
        }
        Ok(Arc::new(Interpolate(text.into_owned())))
    }

    fn materialize(&self, source: &str, _options: &Value) -> Result<Arc<dyn Renderer>, GenerateError> {
        Ok(Arc::new(Interpolate(source.to_string())))
    }
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    check()
}
