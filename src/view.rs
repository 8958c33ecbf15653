//! HTML view rendering: template registry, shared view data and the view builder.

use crate::response::Response;
use arc_swap::ArcSwap;
use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("load template error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("parse template error: {source}")]
    Template {
        #[from]
        source: minijinja::Error,
    },
}

/// Process-wide default template variables, merged into every render.
///
/// Mutation is copy-on-write and reads take an immutable snapshot, so concurrent requests never
/// observe a half-updated map. This is the one piece of cross-request mutable state in the crate.
#[derive(Default)]
pub struct SharedViewData {
    map: ArcSwap<serde_json::Map<String, Value>>,
}

impl SharedViewData {
    pub fn share(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        self.map.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(key.clone(), value.clone());
            next
        });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.load().get(key).cloned()
    }

    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        (**self.map.load()).clone()
    }
}

/// A pre-parsed template set plus the shared data store.
pub struct ViewEngine {
    env: Environment<'static>,
    shared: SharedViewData,
}

impl ViewEngine {
    pub fn empty() -> Self {
        Self { env: Environment::new(), shared: SharedViewData::default() }
    }

    /// Walks `dir` recursively and registers every file under its slash-separated relative
    /// path. A missing directory yields an empty engine, matching "no views configured".
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ViewError> {
        let dir = dir.as_ref();
        let mut engine = Self::empty();
        if !dir.exists() {
            return Ok(engine);
        }

        let mut files = Vec::new();
        collect_files(dir, &mut files)?;

        for path in files {
            let name = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let source = std::fs::read_to_string(&path)?;
            engine.env.add_template_owned(name, source)?;
        }

        Ok(engine)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    pub fn render(&self, name: &str, data: &Value) -> Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(data)
    }

    pub fn shared(&self) -> &SharedViewData {
        &self.shared
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// The "to fields" capability for typed view payloads.
///
/// Any `Serialize` type whose serialized form is an object qualifies; other shapes contribute
/// nothing and log an error.
pub trait ToViewData {
    fn to_view_data(&self) -> serde_json::Map<String, Value>;
}

impl<T: Serialize> ToViewData for T {
    fn to_view_data(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                error!("view data must serialize to an object");
                serde_json::Map::new()
            }
            Err(e) => {
                error!("serialize view data error: {e}");
                serde_json::Map::new()
            }
        }
    }
}

/// Builder for HTML view responses.
///
/// Merge rules: typed payloads overwrite shared keys unconditionally, map payloads never
/// overwrite a shared key and only fill the gaps. The asymmetry is deliberate and mirrors the
/// observed contract.
pub struct View {
    engine: Arc<ViewEngine>,
}

impl View {
    pub(crate) fn new(engine: Arc<ViewEngine>) -> Self {
        Self { engine }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.engine.exists(name)
    }

    /// Renders `name` with the shared data only.
    pub fn make(self, name: &str) -> Response {
        let data = self.engine.shared().snapshot();
        Response::view(name, data)
    }

    /// Renders `name` with a typed payload; payload fields overwrite shared keys.
    pub fn make_with<T: ToViewData>(self, name: &str, payload: &T) -> Response {
        let mut data = self.engine.shared().snapshot();
        for (key, value) in payload.to_view_data() {
            data.insert(key, value);
        }
        Response::view(name, data)
    }

    /// Renders `name` with an explicit map; shared keys win, map keys fill the gaps.
    pub fn make_map(self, name: &str, payload: serde_json::Map<String, Value>) -> Response {
        let mut data = self.engine.shared().snapshot();
        for (key, value) in payload {
            data.entry(key).or_insert(value);
        }
        Response::view(name, data)
    }

    /// Renders the first existing view of `names` with the shared data.
    ///
    /// No existing view is a configuration mistake and panics.
    pub fn first(self, names: &[&str]) -> Response {
        let name = self.first_existing(names);
        self.make(&name)
    }

    pub fn first_with<T: ToViewData>(self, names: &[&str], payload: &T) -> Response {
        let name = self.first_existing(names);
        self.make_with(&name, payload)
    }

    fn first_existing(&self, names: &[&str]) -> String {
        names
            .iter()
            .find(|name| self.engine.exists(name))
            .map(|name| (*name).to_owned())
            .unwrap_or_else(|| panic!("no view exists among {names:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use http_body_util::BodyExt;
    use serde::Serialize;
    use serde_json::json;

    fn engine_with(templates: &[(&str, &str)]) -> Arc<ViewEngine> {
        let mut engine = ViewEngine::empty();
        for (name, source) in templates {
            engine.env.add_template_owned(name.to_string(), source.to_string()).unwrap();
        }
        Arc::new(engine)
    }

    async fn rendered(response: Response, engine: Arc<ViewEngine>) -> String {
        let ctx = Context::with_views(engine);
        let response = response.render(&ctx).await;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn shared_data_snapshots_are_isolated() {
        let shared = SharedViewData::default();
        shared.share("app", "trellis");

        let snapshot = shared.snapshot();
        shared.share("version", "0.3");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(shared.snapshot().len(), 2);
        assert_eq!(shared.get("version"), Some(json!("0.3")));
    }

    #[tokio::test]
    async fn struct_payload_overwrites_shared_keys() {
        #[derive(Serialize)]
        struct Page {
            title: String,
        }

        let engine = engine_with(&[("page.html", "{{ title }} ({{ app }})")]);
        engine.shared().share("title", "shared title");
        engine.shared().share("app", "trellis");

        let response = View::new(engine.clone()).make_with("page.html", &Page { title: "mine".into() });
        assert_eq!(rendered(response, engine).await, "mine (trellis)");
    }

    #[tokio::test]
    async fn map_payload_never_overwrites_shared_keys() {
        let engine = engine_with(&[("page.html", "{{ title }} + {{ extra }}")]);
        engine.shared().share("title", "shared title");

        let mut payload = serde_json::Map::new();
        payload.insert("title".into(), json!("ignored"));
        payload.insert("extra".into(), json!("kept"));

        let response = View::new(engine.clone()).make_map("page.html", payload);
        assert_eq!(rendered(response, engine).await, "shared title + kept");
    }

    #[tokio::test]
    async fn make_uses_shared_data_only() {
        let engine = engine_with(&[("page.html", "hello {{ who }}")]);
        engine.shared().share("who", "world");

        let response = View::new(engine.clone()).make("page.html");
        assert_eq!(rendered(response, engine).await, "hello world");
    }

    #[tokio::test]
    async fn missing_template_renders_a_server_error() {
        let engine = engine_with(&[]);
        let ctx = Context::with_views(engine.clone());
        let response = View::new(engine).make("absent.html").render(&ctx).await;
        assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn first_picks_the_first_existing_view() {
        let engine = engine_with(&[("b.html", "bee")]);
        let response = View::new(engine.clone()).first(&["a.html", "b.html"]);
        assert_eq!(rendered(response, engine).await, "bee");
    }

    #[test]
    #[should_panic(expected = "no view exists")]
    fn first_without_any_existing_view_panics() {
        let engine = engine_with(&[]);
        View::new(engine).first(&["a.html", "b.html"]);
    }

    #[test]
    fn from_dir_registers_nested_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("home.html"), "home").unwrap();
        std::fs::create_dir(dir.path().join("emails")).unwrap();
        std::fs::write(dir.path().join("emails/welcome.html"), "welcome").unwrap();

        let engine = ViewEngine::from_dir(dir.path()).unwrap();
        assert!(engine.exists("home.html"));
        assert!(engine.exists("emails/welcome.html"));
        assert!(!engine.exists("absent.html"));
    }

    #[test]
    fn from_dir_tolerates_a_missing_directory() {
        let engine = ViewEngine::from_dir("/definitely/not/a/views/dir").unwrap();
        assert!(!engine.exists("anything.html"));
    }

    #[test]
    fn non_object_payload_contributes_nothing() {
        let fields = 42u32.to_view_data();
        assert!(fields.is_empty());
    }
}
