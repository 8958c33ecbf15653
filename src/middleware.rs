//! Built-in middleware.

use crate::context::Context;
use crate::handler::{Middleware, Next};
use crate::response::Response;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::info;

/// Request logging middleware, installed as the always-last chain entry by the router.
///
/// Runs closest to the handler so it observes the response descriptor every route produces.
pub struct AccessLog;

#[async_trait]
impl Middleware for AccessLog {
    async fn handle(&self, ctx: Context, next: Next) -> Option<Response> {
        let method = ctx.request().method().clone();
        let path = ctx.request().path().to_owned();
        let started = Instant::now();

        let response = next.run(ctx).await;

        let status = response.as_ref().map(|r| r.status_code().as_u16()).unwrap_or(200);
        info!(%method, %path, status, elapsed_ms = started.elapsed().as_millis() as u64, "handled request");
        response
    }
}

/// Seeds the shared view data store before the downstream runs.
#[derive(Default)]
pub struct ShareViewData {
    entries: Vec<(String, Value)>,
}

impl ShareViewData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Middleware for ShareViewData {
    async fn handle(&self, ctx: Context, next: Next) -> Option<Response> {
        for (key, value) in &self.entries {
            ctx.shared_views().share(key.clone(), value.clone());
        }
        next.run(ctx).await
    }
}
