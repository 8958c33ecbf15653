//! The per-request [`Context`] handed to handlers and middleware.
//!
//! A context is cheap to clone (shared internals) and never crosses requests. It exposes the
//! decoded [`Request`], a staging area for response headers and cookies, a typed value store for
//! middleware to pass data downstream, and the view engine handle.

use crate::body::DecodedBody;
use crate::request::{PathParams, Request};
use crate::response::{Response, Status};
use crate::view::{View, ViewEngine};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::{Extensions, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{error, warn};

#[derive(Clone)]
pub struct Context {
    request: Arc<Request>,
    pending: Arc<Mutex<Pending>>,
    values: Arc<Mutex<Extensions>>,
    views: Arc<ViewEngine>,
}

#[derive(Default)]
pub(crate) struct Pending {
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) cookies: Vec<Cookie>,
}

impl Context {
    /// Builds a context from a buffered inbound request.
    ///
    /// Body decoding happens here, once. A decode failure is logged and leaves the decoded
    /// mapping empty so input resolution degrades to query/route lookup; the request proceeds.
    pub(crate) async fn from_parts(
        parts: Parts,
        body: Bytes,
        params: PathParams,
        remote_addr: Option<SocketAddr>,
        secure: bool,
        views: Arc<ViewEngine>,
    ) -> Self {
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let decoded = match DecodedBody::decode(body.clone(), content_type.as_deref()).await {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("{e}");
                DecodedBody::empty()
            }
        };

        let request = Request::new(parts, params, remote_addr, secure, body, decoded);
        Self {
            request: Arc::new(request),
            pending: Arc::new(Mutex::new(Pending::default())),
            values: Arc::new(Mutex::new(Extensions::new())),
            views,
        }
    }

    /// An empty context detached from any connection, mainly useful in tests and warmup code.
    pub fn background() -> Self {
        let (parts, _) = http::Request::builder().uri("/").body(()).unwrap().into_parts();
        let request = Request::new(parts, PathParams::empty(), None, false, Bytes::new(), DecodedBody::empty());
        Self {
            request: Arc::new(request),
            pending: Arc::new(Mutex::new(Pending::default())),
            values: Arc::new(Mutex::new(Extensions::new())),
            views: Arc::new(ViewEngine::empty()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_views(views: Arc<ViewEngine>) -> Self {
        let mut ctx = Self::background();
        ctx.views = views;
        ctx
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> ResponseHandle<'_> {
        ResponseHandle { ctx: self }
    }

    pub fn view(&self) -> View {
        View::new(self.views.clone())
    }

    pub(crate) fn views(&self) -> &ViewEngine {
        &self.views
    }

    /// The process-wide shared view data store.
    pub fn shared_views(&self) -> &crate::view::SharedViewData {
        self.views.shared()
    }

    /// Stores a typed value for later handlers in the chain.
    pub fn set_value<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.values.lock().unwrap().insert(value);
    }

    /// Retrieves a value stored by an earlier middleware.
    pub fn value<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.values.lock().unwrap().get::<T>().cloned()
    }

    pub(crate) fn take_pending(&self) -> Pending {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

/// Staging access to the eventual response plus the response-builder family.
///
/// Headers and cookies staged here are applied to whichever descriptor ends up rendering.
pub struct ResponseHandle<'c> {
    ctx: &'c Context,
}

impl<'c> ResponseHandle<'c> {
    pub fn header(self, key: &str, value: &str) -> Self {
        match (HeaderName::try_from(key), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.ctx.pending.lock().unwrap().headers.push((name, value)),
            _ => warn!(key, "dropping invalid response header"),
        }
        self
    }

    pub fn cookie(self, cookie: Cookie) -> Self {
        self.ctx.pending.lock().unwrap().cookies.push(cookie);
        self
    }

    /// Stages an expired cookie so the client drops `name`.
    pub fn without_cookie(self, name: &str) -> Self {
        self.cookie(Cookie::new(name, "").max_age(0))
    }

    pub fn data(self, code: StatusCode, content_type: &str, data: impl Into<Bytes>) -> Response {
        Response::data(code, content_type, data)
    }

    pub fn json<T: Serialize>(self, code: StatusCode, payload: &T) -> Response {
        Response::json(code, payload)
    }

    pub fn string(self, code: StatusCode, body: impl Into<String>) -> Response {
        Response::string(code, body)
    }

    pub fn string_with(self, code: StatusCode, content_type: &str, body: impl Into<String>) -> Response {
        Response::string_with(code, content_type, body)
    }

    pub fn file(self, path: impl Into<std::path::PathBuf>) -> Response {
        Response::file(path)
    }

    pub fn download(self, path: impl Into<std::path::PathBuf>, file_name: impl Into<String>) -> Response {
        Response::download(path, file_name)
    }

    pub fn redirect(self, code: StatusCode, location: impl Into<String>) -> Response {
        Response::redirect(code, location)
    }

    pub fn no_content(self) -> Response {
        Response::no_content()
    }

    pub fn no_content_with(self, code: StatusCode) -> Response {
        Response::no_content_with(code)
    }

    pub fn stream<F>(self, code: StatusCode, step: F) -> Response
    where
        F: FnMut(&mut crate::stream::StreamWriter) -> std::io::Result<()> + Send + 'static,
    {
        Response::stream(code, step)
    }

    pub fn status(self, code: StatusCode) -> Status {
        Response::status(code)
    }

    pub fn ok(self) -> Status {
        Response::status(StatusCode::OK)
    }

    pub fn view(self) -> View {
        self.ctx.view()
    }
}

/// An outbound cookie.
#[derive(Debug, Clone)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    expires: Option<SystemTime>,
    secure: bool,
    http_only: bool,
    same_site: SameSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Default,
    Strict,
    Lax,
    None,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: SameSite::Default,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// Serializes into a `Set-Cookie` value. An explicit max-age wins; otherwise a set expiry
    /// is folded into max-age relative to now, already-past expiries expiring immediately.
    pub(crate) fn to_header_value(&self) -> Option<HeaderValue> {
        let mut out = format!("{}={}", self.name, self.value);

        let max_age = self.max_age.or_else(|| {
            self.expires.map(|at| match at.duration_since(SystemTime::now()) {
                Ok(remaining) => remaining.as_secs() as i64,
                Err(_) => 0,
            })
        });
        if let Some(seconds) = max_age {
            out.push_str(&format!("; Max-Age={seconds}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        match self.same_site {
            SameSite::Default => {}
            SameSite::Strict => out.push_str("; SameSite=Strict"),
            SameSite::Lax => out.push_str("; SameSite=Lax"),
            SameSite::None => out.push_str("; SameSite=None"),
        }

        HeaderValue::try_from(out).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_serialization() {
        let cookie = Cookie::new("session", "abc")
            .path("/")
            .domain("example.test")
            .max_age(3600)
            .secure(true)
            .http_only(true)
            .same_site(SameSite::Strict);

        let value = cookie.to_header_value().unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "session=abc; Max-Age=3600; Path=/; Domain=example.test; Secure; HttpOnly; SameSite=Strict"
        );
    }

    #[test]
    fn past_expiry_folds_to_zero_max_age() {
        let cookie = Cookie::new("old", "x").expires(SystemTime::UNIX_EPOCH);
        let value = cookie.to_header_value().unwrap();
        assert_eq!(value.to_str().unwrap(), "old=x; Max-Age=0");
    }

    #[test]
    fn value_store_round_trips() {
        #[derive(Clone, PartialEq, Debug)]
        struct UserId(u64);

        let ctx = Context::background();
        assert_eq!(ctx.value::<UserId>(), None);
        ctx.set_value(UserId(7));
        assert_eq!(ctx.value::<UserId>(), Some(UserId(7)));
    }

    #[test]
    fn staged_headers_accumulate() {
        let ctx = Context::background();
        ctx.response().header("x-one", "1").header("x-two", "2");

        let pending = ctx.take_pending();
        assert_eq!(pending.headers.len(), 2);
    }
}
