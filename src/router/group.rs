//! Route groups: prefix and middleware accumulation over the mux.

use super::{RouteChain, Router};
use crate::context::Context;
use crate::handler::{Handler, Middleware, ResourceController};
use crate::response::Response;
use http::{Method, StatusCode};
use std::mem;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Accumulates a URL prefix and middleware for a set of related registrations.
///
/// `prefix` and `middleware` chain; every terminal registration consumes and clears the pending
/// prefix and local middleware, so one group can be reused for the next route without
/// bleed-through. Sub-groups snapshot the combined state as their inherited baseline.
pub struct Group<'r> {
    router: &'r mut Router,
    origin_prefix: String,
    prefix: String,
    origin_middlewares: Vec<Arc<dyn Middleware>>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

macro_rules! verb {
    ($name:ident, $method:ident) => {
        pub fn $name<H: Handler + 'static>(&mut self, path: &str, handler: H) {
            self.register(Some(Method::$method), path, Arc::new(handler));
        }
    };
}

impl<'r> Group<'r> {
    pub(crate) fn root(router: &'r mut Router) -> Self {
        Self {
            router,
            origin_prefix: String::new(),
            prefix: String::new(),
            origin_middlewares: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    /// Appends a prefix segment for the next registration or sub-group.
    pub fn prefix(&mut self, segment: &str) -> &mut Self {
        self.prefix.push('/');
        self.prefix.push_str(segment);
        self
    }

    /// Adds a middleware for the next registration or sub-group.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Opens a sub-group inheriting the accumulated prefix and middleware, clearing both from
    /// this group.
    pub fn group(&mut self, configure: impl FnOnce(&mut Group)) {
        let mut inherited = self.origin_middlewares.clone();
        inherited.append(&mut self.middlewares);
        let origin_prefix = join_segments(&self.origin_prefix, &mem::take(&mut self.prefix));

        let mut sub = Group {
            router: &mut *self.router,
            origin_prefix,
            prefix: String::new(),
            origin_middlewares: inherited,
            middlewares: Vec::new(),
        };
        configure(&mut sub);
    }

    verb!(get, GET);
    verb!(post, POST);
    verb!(put, PUT);
    verb!(delete, DELETE);
    verb!(patch, PATCH);
    verb!(options, OPTIONS);

    /// Registers `handler` for every HTTP method.
    pub fn any<H: Handler + 'static>(&mut self, path: &str, handler: H) {
        self.register(None, path, Arc::new(handler));
    }

    /// Registers the restful route set for `controller` under `path`.
    pub fn resource<C: ResourceController>(&mut self, path: &str, controller: C) {
        let controller = Arc::new(controller);
        let (base, chain) = self.consume(path);
        let item = merge_slashes(&format!("{base}/{{id}}"));

        let c = controller.clone();
        self.insert(Some(Method::GET), &base, chain.clone(), Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.index(ctx).await }
        }));
        let c = controller.clone();
        self.insert(Some(Method::POST), &base, chain.clone(), Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.store(ctx).await }
        }));
        let c = controller.clone();
        self.insert(Some(Method::GET), &item, chain.clone(), Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.show(ctx).await }
        }));
        let c = controller.clone();
        self.insert(Some(Method::PUT), &item, chain.clone(), Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.update(ctx).await }
        }));
        let c = controller.clone();
        self.insert(Some(Method::PATCH), &item, chain.clone(), Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.update(ctx).await }
        }));
        let c = controller;
        self.insert(Some(Method::DELETE), &item, chain, Arc::new(move |ctx: Context| {
            let c = c.clone();
            async move { c.destroy(ctx).await }
        }));
    }

    /// Serves a single file under `path`, for GET and HEAD.
    pub fn static_file(&mut self, path: &str, file: impl Into<PathBuf>) {
        let file: PathBuf = file.into();
        let (pattern, chain) = self.consume(path);

        let handler: Arc<dyn Handler> = Arc::new(move |_ctx: Context| {
            let file = file.clone();
            async move { Some(Response::file(file)) }
        });

        self.insert(Some(Method::GET), &pattern, chain.clone(), handler.clone());
        self.insert(Some(Method::HEAD), &pattern, chain, handler);
    }

    /// Serves the files under `root` at `prefix`.
    ///
    /// Panics when `prefix` contains route-parameter syntax: that is a configuration mistake,
    /// not a runtime condition.
    pub fn static_dir(&mut self, prefix: &str, root: impl Into<PathBuf>) {
        if prefix.contains(':') || prefix.contains('*') || prefix.contains('{') {
            panic!("url parameters can not be used when serving a static directory");
        }

        let root: PathBuf = root.into();
        let (base, chain) = self.consume(prefix);
        let pattern = merge_slashes(&format!("{base}/{{*path}}"));

        let handler: Arc<dyn Handler> = Arc::new(move |ctx: Context| {
            let root = root.clone();
            async move {
                let rel = ctx.request().route("path");
                let Some(mut resolved) = resolve_static(&root, &rel) else {
                    return Some(Response::no_content_with(StatusCode::NOT_FOUND));
                };
                if resolved.is_dir() {
                    resolved.push("index.html");
                }
                Some(Response::file(resolved))
            }
        });

        self.insert(None, &pattern, chain, handler);
    }

    fn register(&mut self, method: Option<Method>, path: &str, handler: Arc<dyn Handler>) {
        let (pattern, chain) = self.consume(path);
        self.insert(method, &pattern, chain, handler);
    }

    fn insert(
        &mut self,
        method: Option<Method>,
        pattern: &str,
        middlewares: Arc<[Arc<dyn Middleware>]>,
        handler: Arc<dyn Handler>,
    ) {
        self.router.mux.register(method, pattern, RouteChain { middlewares, handler });
    }

    /// Computes the final pattern and flattened chain, clearing the pending prefix and local
    /// middleware.
    fn consume(&mut self, relative: &str) -> (String, Arc<[Arc<dyn Middleware>]>) {
        let pending = mem::take(&mut self.prefix);
        let pattern = merge_slashes(&format!("{}/{}/{}", self.origin_prefix, pending, relative));

        let mut flattened = self.origin_middlewares.clone();
        flattened.append(&mut self.middlewares);
        flattened.extend(self.router.last.iter().cloned());

        (pattern, flattened.into())
    }
}

/// Joins two prefix fragments without touching parameter syntax.
fn join_segments(a: &str, b: &str) -> String {
    merge_slashes(&format!("{a}/{b}"))
}

/// Collapses duplicate slashes, ensures a leading slash, trims a trailing one.
pub(crate) fn merge_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');

    let mut prev_slash = true;
    for ch in path.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }

    out
}

fn resolve_static(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(rel.trim_start_matches('/')).components() {
        match component {
            Component::Normal(segment) => path.push(segment),
            Component::CurDir => {}
            // parent references and absolute segments escape the root
            _ => return None,
        }
    }
    Some(path)
}
