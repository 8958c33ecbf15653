//! Handler and middleware abstractions.
//!
//! Handlers return `Option<Response>`: `Some` hands a descriptor to the dispatch layer for
//! rendering, `None` renders nothing. Middleware wraps the rest of the chain through [`Next`].

use crate::context::Context;
use crate::response::Response;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: Context) -> Option<Response>;
}

/// Any `async fn(Context) -> Option<Response>` is a handler.
#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    async fn handle(&self, ctx: Context) -> Option<Response> {
        (self)(ctx).await
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: Context, next: Next) -> Option<Response>;
}

/// Any `async fn(Context, Next) -> Option<Response>` is a middleware.
#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, next: Next) -> Option<Response> {
        (self)(ctx, next).await
    }
}

/// Cursor over the remaining middleware chain, ending at the route handler.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn Handler>,
    index: usize,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn Middleware>]>, handler: Arc<dyn Handler>) -> Self {
        Self { chain, handler, index: 0 }
    }

    /// Runs the rest of the chain and returns whatever the downstream produced.
    pub async fn run(self, ctx: Context) -> Option<Response> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Self { chain: self.chain, handler: self.handler, index: self.index + 1 };
                middleware.handle(ctx, next).await
            }
            None => self.handler.handle(ctx).await,
        }
    }
}

/// Restful controller registered in one call by [`Group::resource`](crate::router::Group::resource).
#[async_trait]
pub trait ResourceController: Send + Sync + 'static {
    async fn index(&self, ctx: Context) -> Option<Response>;
    async fn store(&self, ctx: Context) -> Option<Response>;
    async fn show(&self, ctx: Context) -> Option<Response>;
    async fn update(&self, ctx: Context) -> Option<Response>;
    async fn destroy(&self, ctx: Context) -> Option<Response>;
}
