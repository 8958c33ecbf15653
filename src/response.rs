//! Deferred response descriptors and the single render step.
//!
//! Builder calls capture a status code and payload and never touch the output stream; the
//! dispatch layer renders the descriptor after the handler returns one. Rendering consumes the
//! descriptor, so a response cannot be written twice.

use crate::context::Context;
use crate::stream::{spawn_stream, StreamFn, StreamWriter};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION};
use http::{HeaderValue, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::StreamBody;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

/// A deferred, not-yet-rendered HTTP response.
pub struct Response {
    kind: Kind,
}

enum Kind {
    Data { code: StatusCode, content_type: String, data: Bytes },
    Json { code: StatusCode, payload: Value },
    Text { code: StatusCode, content_type: Option<String>, body: String },
    File { path: PathBuf },
    Download { path: PathBuf, file_name: String },
    Redirect { code: StatusCode, location: String },
    NoContent { code: StatusCode },
    Stream { code: StatusCode, step: StreamFn },
    View { name: String, data: serde_json::Map<String, Value> },
}

impl Response {
    pub fn data(code: StatusCode, content_type: &str, data: impl Into<Bytes>) -> Self {
        Self { kind: Kind::Data { code, content_type: content_type.to_owned(), data: data.into() } }
    }

    pub fn json<T: Serialize>(code: StatusCode, payload: &T) -> Self {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                error!("serialize json response error: {e}");
                Value::Null
            }
        };
        Self { kind: Kind::Json { code, payload } }
    }

    pub fn string(code: StatusCode, body: impl Into<String>) -> Self {
        Self { kind: Kind::Text { code, content_type: None, body: body.into() } }
    }

    /// Plain-text body with a caller-supplied content type.
    pub fn string_with(code: StatusCode, content_type: &str, body: impl Into<String>) -> Self {
        Self { kind: Kind::Text { code, content_type: Some(content_type.to_owned()), body: body.into() } }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { kind: Kind::File { path: path.into() } }
    }

    pub fn download(path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self { kind: Kind::Download { path: path.into(), file_name: file_name.into() } }
    }

    pub fn redirect(code: StatusCode, location: impl Into<String>) -> Self {
        Self { kind: Kind::Redirect { code, location: location.into() } }
    }

    pub fn no_content() -> Self {
        Self::no_content_with(StatusCode::NO_CONTENT)
    }

    pub fn no_content_with(code: StatusCode) -> Self {
        Self { kind: Kind::NoContent { code } }
    }

    pub fn stream<F>(code: StatusCode, step: F) -> Self
    where
        F: FnMut(&mut StreamWriter) -> io::Result<()> + Send + 'static,
    {
        Self { kind: Kind::Stream { code, step: Box::new(step) } }
    }

    pub(crate) fn view(name: impl Into<String>, data: serde_json::Map<String, Value>) -> Self {
        Self { kind: Kind::View { name: name.into(), data } }
    }

    /// Fixes a status code once and exposes the builder family without repeating it.
    pub fn status(code: StatusCode) -> Status {
        Status { code }
    }

    pub fn ok() -> Status {
        Status { code: StatusCode::OK }
    }

    /// The status code this descriptor will render with.
    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            Kind::Data { code, .. }
            | Kind::Json { code, .. }
            | Kind::Text { code, .. }
            | Kind::Redirect { code, .. }
            | Kind::NoContent { code }
            | Kind::Stream { code, .. } => *code,
            Kind::File { .. } | Kind::Download { .. } | Kind::View { .. } => StatusCode::OK,
        }
    }

    /// Materializes the descriptor, applying headers and cookies staged on the context.
    ///
    /// Render failures never propagate: unreadable files become 404, template failures become
    /// 500, stream callback errors just end the stream.
    pub async fn render(self, ctx: &Context) -> http::Response<ResponseBody> {
        let mut response = match self.kind {
            Kind::Data { code, content_type, data } => {
                let mut response = plain(code, ResponseBody::once(data));
                set_content_type(&mut response, &content_type);
                response
            }
            Kind::Json { code, payload } => {
                let data = match serde_json::to_vec(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        error!("encode json response error: {e}");
                        Vec::new()
                    }
                };
                let mut response = plain(code, ResponseBody::once(Bytes::from(data)));
                set_content_type(&mut response, mime::APPLICATION_JSON.as_ref());
                response
            }
            Kind::Text { code, content_type, body } => {
                let mut response = plain(code, ResponseBody::once(Bytes::from(body)));
                let content_type = content_type.as_deref().unwrap_or(mime::TEXT_PLAIN_UTF_8.as_ref());
                set_content_type(&mut response, content_type);
                response
            }
            Kind::File { path } => render_file(&path, None).await,
            Kind::Download { path, file_name } => render_file(&path, Some(&file_name)).await,
            Kind::Redirect { code, location } => {
                // the wrapped renderer only distinguishes permanent from temporary
                let code = if code == StatusCode::MOVED_PERMANENTLY { code } else { StatusCode::FOUND };
                let mut response = plain(code, ResponseBody::empty());
                match HeaderValue::try_from(location.as_str()) {
                    Ok(value) => {
                        response.headers_mut().insert(LOCATION, value);
                    }
                    Err(_) => warn!(%location, "dropping invalid redirect location"),
                }
                response
            }
            Kind::NoContent { code } => plain(code, ResponseBody::empty()),
            Kind::Stream { code, step } => {
                let rx = spawn_stream(step);
                let frames = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
                plain(code, ResponseBody::stream(StreamBody::new(frames)))
            }
            Kind::View { name, data } => match ctx.views().render(&name, &Value::Object(data)) {
                Ok(html) => {
                    let mut response = plain(StatusCode::OK, ResponseBody::once(Bytes::from(html)));
                    set_content_type(&mut response, mime::TEXT_HTML_UTF_8.as_ref());
                    response
                }
                Err(e) => {
                    error!("render view '{name}' error: {e}");
                    plain(StatusCode::INTERNAL_SERVER_ERROR, ResponseBody::empty())
                }
            },
        };

        apply_pending(ctx, &mut response);
        response
    }
}

/// Builder family scoped to an already-fixed status code.
pub struct Status {
    code: StatusCode,
}

impl Status {
    pub fn data(self, content_type: &str, data: impl Into<Bytes>) -> Response {
        Response::data(self.code, content_type, data)
    }

    pub fn json<T: Serialize>(self, payload: &T) -> Response {
        Response::json(self.code, payload)
    }

    pub fn string(self, body: impl Into<String>) -> Response {
        Response::string(self.code, body)
    }

    pub fn string_with(self, content_type: &str, body: impl Into<String>) -> Response {
        Response::string_with(self.code, content_type, body)
    }

    pub fn stream<F>(self, step: F) -> Response
    where
        F: FnMut(&mut StreamWriter) -> io::Result<()> + Send + 'static,
    {
        Response::stream(self.code, step)
    }
}

fn plain(code: StatusCode, body: ResponseBody) -> http::Response<ResponseBody> {
    let mut response = http::Response::new(body);
    *response.status_mut() = code;
    response
}

fn set_content_type(response: &mut http::Response<ResponseBody>, content_type: &str) {
    match HeaderValue::try_from(content_type) {
        Ok(value) => {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        Err(_) => warn!(content_type, "dropping invalid content type"),
    }
}

fn apply_pending(ctx: &Context, response: &mut http::Response<ResponseBody>) {
    let pending = ctx.take_pending();
    for (name, value) in pending.headers {
        response.headers_mut().insert(name, value);
    }
    for cookie in pending.cookies {
        if let Some(value) = cookie.to_header_value() {
            response.headers_mut().append(http::header::SET_COOKIE, value);
        }
    }
}

async fn render_file(path: &Path, download_as: Option<&str>) -> http::Response<ResponseBody> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), "read file error: {e}");
            return plain(StatusCode::NOT_FOUND, ResponseBody::empty());
        }
    };

    let mut response = plain(StatusCode::OK, ResponseBody::once(Bytes::from(data)));
    set_content_type(&mut response, content_type_for(path));

    if let Some(file_name) = download_as {
        let disposition = format!("attachment; filename=\"{file_name}\"");
        match HeaderValue::try_from(disposition) {
            Ok(value) => {
                response.headers_mut().insert(CONTENT_DISPOSITION, value);
            }
            Err(_) => warn!(file_name, "dropping invalid download file name"),
        }
    }

    response
}

pub(crate) fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or("").to_ascii_lowercase().as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8.as_ref(),
        "css" => mime::TEXT_CSS.as_ref(),
        "js" => mime::APPLICATION_JAVASCRIPT.as_ref(),
        "json" => mime::APPLICATION_JSON.as_ref(),
        "txt" => mime::TEXT_PLAIN_UTF_8.as_ref(),
        "png" => mime::IMAGE_PNG.as_ref(),
        "jpg" | "jpeg" => mime::IMAGE_JPEG.as_ref(),
        "gif" => mime::IMAGE_GIF.as_ref(),
        "svg" => mime::IMAGE_SVG.as_ref(),
        "pdf" => mime::APPLICATION_PDF.as_ref(),
        _ => mime::APPLICATION_OCTET_STREAM.as_ref(),
    }
}

/// Response body handed to the connection layer, either a single buffer or a boxed stream.
pub struct ResponseBody {
    inner: BodyKind,
}

enum BodyKind {
    Once(Option<Bytes>),
    Stream(UnsyncBoxBody<Bytes, Infallible>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { inner: BodyKind::Once(None) }
    }

    pub fn once(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::empty()
        } else {
            Self { inner: BodyKind::Once(Some(bytes)) }
        }
    }

    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes, Error = Infallible> + Send + 'static,
    {
        Self { inner: BodyKind::Stream(UnsyncBoxBody::new(body)) }
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            BodyKind::Once(option_bytes) if option_bytes.is_none() => Poll::Ready(None),
            BodyKind::Once(option_bytes) => Poll::Ready(Some(Ok(Frame::data(option_bytes.take().unwrap())))),
            BodyKind::Stream(box_body) => Pin::new(box_body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            BodyKind::Once(option_bytes) => option_bytes.is_none(),
            BodyKind::Stream(box_body) => box_body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            BodyKind::Once(None) => SizeHint::with_exact(0),
            BodyKind::Once(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            BodyKind::Stream(box_body) => box_body.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Cookie};
    use http_body_util::BodyExt;
    use serde_json::json;

    async fn body_bytes(response: http::Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn json_render_sets_status_and_round_trips() {
        let payload = json!({"name": "ada", "tags": ["a", "b"]});
        let response = Response::json(StatusCode::CREATED, &payload).render(&Context::background()).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");

        let decoded: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn string_render_defaults_to_plain_text() {
        let response = Response::string(StatusCode::OK, "hello").render(&Context::background()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain; charset=utf-8");
        assert_eq!(body_bytes(response).await.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn string_render_honors_a_supplied_content_type() {
        let response = Response::string_with(StatusCode::OK, "text/csv", "a,b\n1,2")
            .render(&Context::background())
            .await;

        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/csv");
        assert_eq!(body_bytes(response).await.as_ref(), b"a,b\n1,2");
    }

    #[tokio::test]
    async fn data_render_uses_the_declared_content_type() {
        let response = Response::data(StatusCode::OK, "image/png", Bytes::from_static(b"PNG"))
            .render(&Context::background())
            .await;

        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(body_bytes(response).await.as_ref(), b"PNG");
    }

    #[tokio::test]
    async fn redirect_distinguishes_permanent_from_temporary() {
        let response = Response::redirect(StatusCode::MOVED_PERMANENTLY, "/new")
            .render(&Context::background())
            .await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/new");

        let response = Response::redirect(StatusCode::TEMPORARY_REDIRECT, "/elsewhere")
            .render(&Context::background())
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/elsewhere");
    }

    #[tokio::test]
    async fn no_content_has_an_empty_body() {
        let response = Response::no_content().render(&Context::background()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn status_builder_reuses_the_fixed_code() {
        let response = Response::status(StatusCode::ACCEPTED).json(&json!({"ok": true}));
        assert_eq!(response.status_code(), StatusCode::ACCEPTED);

        let response = Response::ok().string("fine");
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn staged_headers_and_cookies_apply_on_render() {
        let ctx = Context::background();
        ctx.response().header("x-trace", "t1").cookie(Cookie::new("session", "s1").path("/"));

        let response = Response::no_content().render(&ctx).await;
        assert_eq!(response.headers().get("x-trace").unwrap(), "t1");
        assert_eq!(response.headers().get(http::header::SET_COOKIE).unwrap(), "session=s1; Path=/");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_render_emits_chunks_until_the_callback_errors() {
        let mut remaining = 2u32;
        let response = Response::stream(StatusCode::OK, move |w| {
            if remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "done"));
            }
            w.write_string("x")?;
            remaining -= 1;
            Ok(())
        })
        .render(&Context::background())
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await.as_ref(), b"xx");
    }

    #[tokio::test]
    async fn file_render_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "file body").unwrap();

        let response = Response::file(&path).render(&Context::background()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain; charset=utf-8");
        assert_eq!(body_bytes(response).await.as_ref(), b"file body");
    }

    #[tokio::test]
    async fn missing_file_renders_not_found() {
        let response = Response::file("/definitely/not/here.bin").render(&Context::background()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_sets_the_attachment_disposition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "a,b").unwrap();

        let response = Response::download(&path, "export.csv").render(&Context::background()).await;
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"export.csv\""
        );
    }
}
