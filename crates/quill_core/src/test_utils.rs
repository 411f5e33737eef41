use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use quill_store::{
    Content, Lookup, MemoryStore, NamingResolver, OpToken, PartialRecord, RenderError, Renderer,
    Store, StoreError,
};
use serde_json::Value;

use crate::generator::{GenerateError, Generator};

/// Renderer replacing `{{key}}` with the matching context value.
pub struct Substitute {
    template: String,
}

impl Renderer for Substitute {
    fn render(&self, context: &Value, _options: &Value) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(RenderError::new("unterminated placeholder"));
            };
            match context.get(after[..end].trim()) {
                Some(Value::String(s)) => out.push_str(s),
                Some(value) => out.push_str(&value.to_string()),
                None => {}
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn source(&self) -> Option<&str> {
        Some(&self.template)
    }
}

pub fn renderer(template: &str) -> Arc<dyn Renderer> {
    Arc::new(Substitute {
        template: template.to_string(),
    })
}

/// Generator producing [`Substitute`] renderers.
///
/// Content containing `{{!fail}}` is rejected. Calls are counted.
#[derive(Default)]
pub struct TestGenerator {
    pub generated: AtomicUsize,
    pub materialized: AtomicUsize,
}

impl TestGenerator {
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn materialized(&self) -> usize {
        self.materialized.load(Ordering::SeqCst)
    }
}

impl Generator for TestGenerator {
    fn generate(&self, content: &Content, _options: &Value) -> Result<Arc<dyn Renderer>, GenerateError> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        let text = content.as_text();
        if text.contains("{{!fail}}") {
            return Err(GenerateError::new("template contains a failure marker"));
        }
        Ok(renderer(&text))
    }

    fn materialize(&self, source: &str, _options: &Value) -> Result<Arc<dyn Renderer>, GenerateError> {
        self.materialized.fetch_add(1, Ordering::SeqCst);
        Ok(renderer(source))
    }
}

/// Memory store whose content reads take a while and are counted.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    pub reads: AtomicUsize,
}

impl SlowStore {
    pub fn new(resolver: Arc<NamingResolver>, delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(resolver),
            delay,
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for SlowStore {
    fn backend(&self) -> &'static str {
        "slow"
    }

    fn resolver(&self) -> &NamingResolver {
        self.inner.resolver()
    }

    fn overlay(&self) -> &MemoryStore {
        &self.inner
    }

    async fn read_content(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        token
            .run("slow read", async {
                tokio::time::sleep(self.delay).await;
                Ok(())
            })
            .await?;
        self.inner.read_content(lookup, token).await
    }

    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError> {
        self.inner.write_content(lookup, content, token).await
    }

    async fn unregister(&self, name: &str, token: &OpToken) -> Result<(), StoreError> {
        self.inner.unregister(name, token).await
    }

    async fn clear(&self, all: bool, token: &OpToken) -> Result<(), StoreError> {
        Store::clear(&self.inner, all, token).await
    }
}
