//! Routing: the matchit-backed mux and the dispatch pipeline.
//!
//! Pattern matching is delegated entirely to [`matchit`]; this layer stores one router per HTTP
//! method (plus an any-method table), hands flattened middleware chains to registration, and
//! drives request dispatch: buffer the body, build the context, run the chain, render.

mod group;

pub use group::Group;

use crate::context::Context;
use crate::handler::{Handler, Middleware, Next};
use crate::middleware::AccessLog;
use crate::request::PathParams;
use crate::response::{Response, ResponseBody};
use crate::view::{ViewEngine, ViewError};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Limited};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// A registered route: the flattened middleware chain plus the handler.
pub(crate) struct RouteChain {
    pub(crate) middlewares: Arc<[Arc<dyn Middleware>]>,
    pub(crate) handler: Arc<dyn Handler>,
}

/// Thin wrapper around one [`matchit::Router`] per method.
pub(crate) struct Mux {
    methods: HashMap<Method, matchit::Router<Arc<RouteChain>>>,
    any: matchit::Router<Arc<RouteChain>>,
}

impl Mux {
    fn new() -> Self {
        Self { methods: HashMap::new(), any: matchit::Router::new() }
    }

    /// Registers a route; `None` matches every method. A pattern conflict is a programming
    /// mistake and panics.
    pub(crate) fn register(&mut self, method: Option<Method>, pattern: &str, chain: RouteChain) {
        let chain = Arc::new(chain);
        let table = match method {
            Some(method) => self.methods.entry(method).or_insert_with(matchit::Router::new),
            None => &mut self.any,
        };

        if let Err(e) = table.insert(pattern, chain) {
            panic!("register route '{pattern}' error: {e}");
        }
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<(Arc<RouteChain>, PathParams)> {
        if let Some(table) = self.methods.get(method) {
            if let Ok(matched) = table.at(path) {
                return Some((matched.value.clone(), matched.params.into()));
            }
        }

        self.any.at(path).ok().map(|matched| (matched.value.clone(), matched.params.into()))
    }
}

/// The root router: route registration surface plus the dispatch pipeline.
pub struct Router {
    pub(crate) mux: Mux,
    pub(crate) last: Vec<Arc<dyn Middleware>>,
    global: Vec<Arc<dyn Middleware>>,
    fallback: Option<Arc<dyn Handler>>,
    views: Arc<ViewEngine>,
    max_body_bytes: usize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            mux: Mux::new(),
            last: vec![Arc::new(AccessLog)],
            global: Vec::new(),
            fallback: None,
            views: Arc::new(ViewEngine::empty()),
            max_body_bytes: 4 << 20,
        }
    }

    /// Hands out a fresh root group for registration. Groups are cheap; take a new one whenever
    /// convenient.
    pub fn routes(&mut self) -> Group<'_> {
        Group::root(self)
    }

    /// Loads the template set from `dir`, carrying over any already-shared view data.
    pub fn views(&mut self, dir: impl AsRef<Path>) -> Result<&mut Self, ViewError> {
        let engine = ViewEngine::from_dir(dir)?;
        for (key, value) in self.views.shared().snapshot() {
            engine.shared().share(key, value);
        }
        self.views = Arc::new(engine);
        Ok(self)
    }

    /// Seeds the process-wide shared view data.
    pub fn share(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.views.shared().share(key, value);
    }

    /// Prepends `middleware` to every dispatched chain, including the fallback.
    pub fn global_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.global.push(Arc::new(middleware));
        self
    }

    /// Handler for requests no route matches.
    pub fn fallback(&mut self, handler: impl Handler + 'static) -> &mut Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Upper bound for buffering a request body; larger bodies decode as empty.
    pub fn max_body_bytes(&mut self, limit: usize) -> &mut Self {
        self.max_body_bytes = limit;
        self
    }

    /// Runs one request through routing, the middleware chain and the render step.
    pub async fn dispatch<B>(
        &self,
        req: http::Request<B>,
        remote_addr: Option<SocketAddr>,
        secure: bool,
    ) -> http::Response<ResponseBody>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        let body_bytes = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("read request body error: {e}");
                Bytes::new()
            }
        };

        let method = parts.method.clone();
        let path = parts.uri.path().to_owned();

        match self.mux.lookup(&method, &path) {
            Some((route, params)) => {
                let ctx =
                    Context::from_parts(parts, body_bytes, params, remote_addr, secure, self.views.clone()).await;
                let next = Next::new(self.with_global(&route.middlewares), route.handler.clone());
                self.finish(ctx, next).await
            }
            None => {
                let ctx = Context::from_parts(
                    parts,
                    body_bytes,
                    PathParams::empty(),
                    remote_addr,
                    secure,
                    self.views.clone(),
                )
                .await;

                match &self.fallback {
                    Some(handler) => {
                        let chain = self.with_global(&Arc::from(self.last.clone()));
                        let next = Next::new(chain, handler.clone());
                        self.finish(ctx, next).await
                    }
                    None => Response::string(StatusCode::NOT_FOUND, "404 page not found").render(&ctx).await,
                }
            }
        }
    }

    async fn finish(&self, ctx: Context, next: Next) -> http::Response<ResponseBody> {
        match next.run(ctx.clone()).await {
            Some(response) => response.render(&ctx).await,
            // nothing to render; an empty 200 still carries staged headers and cookies
            None => Response::no_content_with(StatusCode::OK).render(&ctx).await,
        }
    }

    fn with_global(&self, chain: &Arc<[Arc<dyn Middleware>]>) -> Arc<[Arc<dyn Middleware>]> {
        if self.global.is_empty() {
            return chain.clone();
        }

        self.global.iter().cloned().chain(chain.iter().cloned()).collect::<Vec<_>>().into()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ResourceController;
    use async_trait::async_trait;
    use http::header::CONTENT_TYPE;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn send(router: &Router, method: Method, target: &str) -> http::Response<ResponseBody> {
        let req = http::Request::builder()
            .method(method)
            .uri(target)
            .body(Full::new(Bytes::new()))
            .unwrap();
        router.dispatch(req, None, false).await
    }

    async fn body_string(response: http::Response<ResponseBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn routes_dispatch_by_method_and_pattern() {
        let mut router = Router::new();
        router.routes().get("/users/{id}", |ctx: Context| async move {
            Some(Response::ok().string(format!("user {}", ctx.request().route("id"))))
        });
        router.routes().post("/users", |_ctx: Context| async move {
            Some(Response::status(StatusCode::CREATED).string("created"))
        });

        let response = send(&router, Method::GET, "/users/42").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "user 42");

        let response = send(&router, Method::POST, "/users").await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&router, Method::DELETE, "/users").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn any_routes_match_every_method() {
        let mut router = Router::new();
        router.routes().any("/ping", |_ctx: Context| async move { Some(Response::ok().string("pong")) });

        for method in [Method::GET, Method::POST, Method::DELETE] {
            let response = send(&router, method, "/ping").await;
            assert_eq!(body_string(response).await, "pong");
        }
    }

    #[tokio::test]
    async fn unmatched_requests_get_the_default_not_found() {
        let router = Router::new();
        let response = send(&router, Method::GET, "/nowhere").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "404 page not found");
    }

    #[tokio::test]
    async fn fallback_handles_unmatched_requests() {
        let mut router = Router::new();
        router.fallback(|_ctx: Context| async move {
            Some(Response::status(StatusCode::NOT_FOUND).json(&serde_json::json!({"missing": true})))
        });

        let response = send(&router, Method::GET, "/nowhere").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn global_middleware_runs_before_route_middleware() {
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        let mut router = Router::new();
        router.global_middleware(|ctx: Context, next: Next| async move {
            ctx.set_value(ORDER.fetch_add(1, Ordering::SeqCst));
            next.run(ctx).await
        });

        let mut group = router.routes();
        group.middleware(|ctx: Context, next: Next| async move {
            // the global marker must already be present
            assert!(ctx.value::<usize>().is_some());
            next.run(ctx).await
        });
        group.get("/x", |_ctx: Context| async move { Some(Response::no_content()) });

        let response = send(&router, Method::GET, "/x").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn handler_returning_none_sends_an_empty_ok_with_staged_headers() {
        let mut router = Router::new();
        router.routes().get("/silent", |ctx: Context| async move {
            ctx.response().header("x-seen", "yes");
            None
        });

        let response = send(&router, Method::GET, "/silent").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-seen").unwrap(), "yes");
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn json_bodies_are_decoded_for_handlers() {
        let mut router = Router::new();
        router.routes().post("/echo", |ctx: Context| async move {
            Some(Response::ok().string(ctx.request().input("user.name")))
        });

        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(br#"{"user": {"name": "ada"}}"#)))
            .unwrap();
        let response = router.dispatch(req, None, false).await;
        assert_eq!(body_string(response).await, "ada");
    }

    #[tokio::test]
    async fn oversized_bodies_degrade_to_field_absent() {
        let mut router = Router::new();
        router.max_body_bytes(8);
        router.routes().post("/echo", |ctx: Context| async move {
            Some(Response::ok().string(ctx.request().input_or("name", "absent")))
        });

        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(br#"{"name": "a value far beyond the limit"}"#)))
            .unwrap();
        let response = router.dispatch(req, None, false).await;
        assert_eq!(body_string(response).await, "absent");
    }

    #[tokio::test]
    async fn malformed_bodies_do_not_fail_the_request() {
        let mut router = Router::new();
        router.routes().post("/echo", |ctx: Context| async move {
            Some(Response::ok().string(ctx.request().input_or("name", "absent")))
        });

        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/echo?name=from-query")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let response = router.dispatch(req, None, false).await;
        assert_eq!(response.status(), StatusCode::OK);
        // resolution degraded to the query string
        assert_eq!(body_string(response).await, "from-query");
    }

    struct Things;

    #[async_trait]
    impl ResourceController for Things {
        async fn index(&self, _ctx: Context) -> Option<Response> {
            Some(Response::ok().string("index"))
        }
        async fn store(&self, _ctx: Context) -> Option<Response> {
            Some(Response::status(StatusCode::CREATED).string("store"))
        }
        async fn show(&self, ctx: Context) -> Option<Response> {
            Some(Response::ok().string(format!("show {}", ctx.request().route("id"))))
        }
        async fn update(&self, ctx: Context) -> Option<Response> {
            Some(Response::ok().string(format!("update {}", ctx.request().route("id"))))
        }
        async fn destroy(&self, ctx: Context) -> Option<Response> {
            Some(Response::no_content())
        }
    }

    #[tokio::test]
    async fn resource_registers_the_full_route_set() {
        let mut router = Router::new();
        router.routes().prefix("api").resource("/things", Things);

        assert_eq!(body_string(send(&router, Method::GET, "/api/things").await).await, "index");
        assert_eq!(send(&router, Method::POST, "/api/things").await.status(), StatusCode::CREATED);
        assert_eq!(body_string(send(&router, Method::GET, "/api/things/7").await).await, "show 7");
        assert_eq!(body_string(send(&router, Method::PUT, "/api/things/7").await).await, "update 7");
        assert_eq!(body_string(send(&router, Method::PATCH, "/api/things/7").await).await, "update 7");
        assert_eq!(send(&router, Method::DELETE, "/api/things/7").await.status(), StatusCode::NO_CONTENT);
    }
}
