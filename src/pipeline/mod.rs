//! Per-route request pipelines.
//!
//! For every route descriptor discovered on a controller, an ordered chain
//! is registered against the router for each declared HTTP method:
//!
//! 1. error boundary — converts recognized domain errors into structured
//!    responses, rethrows everything else;
//! 2. route-specific middlewares, in declared order;
//! 3. input assembly (path params <- query <- body <- files, later wins),
//!    optional tap transform, schema validation;
//! 4. handler dispatch — a non-empty return value becomes the response body.
//!
//! App-level middlewares run outside the boundary. The chain is a Koa-style
//! onion over a shared request context: each middleware receives the context
//! and a `next` continuation for the remainder of the chain, rebuilt per
//! request from shared handles. Multiple methods on one descriptor register
//! the same pipeline at the same path, not independent copies.

use crate::controller::{Controller, RouteInvoke};
use crate::error::{EnsembleError, Result};
use crate::event::Signals;
use crate::logger::Logger;
use crate::registry::{self, HttpMethod, Tap};
use crate::service::AppHandle;
use crate::validate::{compile_schema, validate_compiled};
use axum::body::to_bytes;
use axum::extract::{FromRequest, Multipart, RawPathParams, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};

pub type JsonMap = serde_json::Map<String, Value>;

/// The remainder of a middleware chain.
pub type Next = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A middleware over the shared request context.
pub type MiddlewareFn = Arc<dyn Fn(Arc<Ctx>, Next) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Box an async closure into a [`MiddlewareFn`].
pub fn middleware<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Arc<Ctx>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

#[derive(Clone)]
enum ResponseBody {
    None,
    Text(String),
    Json(Value),
}

#[derive(Clone)]
struct ResponseParts {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self {
            status: None,
            headers: HeaderMap::new(),
            body: ResponseBody::None,
        }
    }
}

/// Request context shared along one pipeline run.
///
/// Request-side state is immutable once assembled; response state lives
/// behind a mutex so middlewares and handlers can write to it through the
/// shared reference.
pub struct Ctx {
    app: AppHandle,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub params: JsonMap,
    pub query: JsonMap,
    pub body: Value,
    pub files: JsonMap,
    response: Mutex<ResponseParts>,
}

impl Ctx {
    /// A context not backed by a live request. Useful for exercising
    /// middlewares and handlers directly.
    pub fn synthetic(app: AppHandle, method: Method, path: impl Into<String>) -> Self {
        Self {
            app,
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            params: JsonMap::new(),
            query: JsonMap::new(),
            body: Value::Null,
            files: JsonMap::new(),
            response: Mutex::new(ResponseParts::default()),
        }
    }

    pub fn with_params(mut self, params: JsonMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_query(mut self, query: JsonMap) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_files(mut self, files: JsonMap) -> Self {
        self.files = files;
        self
    }

    pub fn app(&self) -> &AppHandle {
        &self.app
    }

    pub fn status(&self) -> Option<u16> {
        self.response.lock().unwrap().status.map(|s| s.as_u16())
    }

    pub fn set_status(&self, status: u16) {
        if let Ok(status) = StatusCode::from_u16(status) {
            self.response.lock().unwrap().status = Some(status);
        }
    }

    /// Set a response header; invalid names/values are ignored.
    pub fn set_header(&self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) else {
            return;
        };
        self.response.lock().unwrap().headers.insert(name, value);
    }

    pub fn set_body_text(&self, text: impl Into<String>) {
        self.response.lock().unwrap().body = ResponseBody::Text(text.into());
    }

    pub fn set_body_json(&self, value: Value) {
        self.response.lock().unwrap().body = ResponseBody::Json(value);
    }

    pub fn response_json(&self) -> Option<Value> {
        match &self.response.lock().unwrap().body {
            ResponseBody::Json(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Validate a value against a schema, raising `InvalidInput` on failure.
    pub fn validate(&self, value: &Value, schema: &Value) -> Result<Value> {
        crate::validate::validate(value, schema)
    }

    /// Build the route input object by shallow-merging, later sources
    /// overwriting earlier ones: path params, query, body, files.
    pub fn assemble_input(&self) -> Value {
        let mut merged = self.params.clone();
        for (k, v) in &self.query {
            merged.insert(k.clone(), v.clone());
        }
        if let Value::Object(body) = &self.body {
            for (k, v) in body {
                merged.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &self.files {
            merged.insert(k.clone(), v.clone());
        }
        Value::Object(merged)
    }

    fn into_axum_response(&self) -> Response {
        let parts = self.response.lock().unwrap().clone();

        let mut response = match parts.body {
            ResponseBody::None => match parts.status {
                Some(status) => status.into_response(),
                None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            },
            ResponseBody::Text(text) => {
                let status = parts.status.unwrap_or(StatusCode::OK);
                let content_type = if text.trim_start().starts_with('<') {
                    "text/html; charset=utf-8"
                } else {
                    "text/plain; charset=utf-8"
                };
                (status, [(header::CONTENT_TYPE, content_type)], text).into_response()
            }
            ResponseBody::Json(value) => {
                let status = parts.status.unwrap_or(StatusCode::OK);
                (status, axum::Json(value)).into_response()
            }
        };

        for (name, value) in parts.headers.iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

/// Compose a middleware list over a shared context into one continuation.
pub(crate) fn compose(ctx: &Arc<Ctx>, middlewares: &[MiddlewareFn], tail: Next) -> Next {
    let mut next = tail;
    for mw in middlewares.iter().rev() {
        let mw = Arc::clone(mw);
        let ctx = Arc::clone(ctx);
        let rest = next;
        next = Box::new(move || mw(ctx, rest));
    }
    next
}

/// The boundary converting recognized domain errors into structured
/// responses. Unknown errors pass through to the transport error channel.
pub(crate) fn error_boundary() -> MiddlewareFn {
    Arc::new(|ctx, next| {
        Box::pin(async move {
            match next().await {
                Err(EnsembleError::Biz(biz)) => {
                    ctx.set_status(biz.status);
                    ctx.set_body_json(serde_json::to_value(&biz).unwrap_or(Value::Null));
                    Ok(())
                }
                other => other,
            }
        })
    })
}

struct CompiledInput {
    tap: Option<Tap>,
    validator: jsonschema::Validator,
}

impl CompiledInput {
    fn assemble(&self, ctx: &Ctx) -> Result<Value> {
        let mut input = ctx.assemble_input();
        if let Some(tap) = &self.tap {
            input = tap.apply(input);
        }
        validate_compiled(&self.validator, &input)?;
        Ok(input)
    }
}

/// One route's wired chain, shared by every HTTP method the descriptor
/// declares.
pub(crate) struct RoutePipeline {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) methods: Vec<HttpMethod>,
    middlewares: Vec<MiddlewareFn>,
    input: Option<CompiledInput>,
    invoke: RouteInvoke,
}

impl RoutePipeline {
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        ctx: Arc<Ctx>,
        app_middlewares: &[MiddlewareFn],
    ) -> Result<()> {
        let pipeline = Arc::clone(&self);
        let tail_ctx = Arc::clone(&ctx);
        let tail: Next = Box::new(move || {
            Box::pin(async move {
                let input = match &pipeline.input {
                    Some(spec) => Some(spec.assemble(&tail_ctx)?),
                    None => None,
                };
                let data = (pipeline.invoke)(Arc::clone(&tail_ctx), input).await?;
                if let Some(value) = data {
                    if !value.is_null() {
                        tail_ctx.set_body_json(value);
                    }
                }
                Ok(())
            })
        });

        let mut chain: Vec<MiddlewareFn> =
            Vec::with_capacity(app_middlewares.len() + 1 + self.middlewares.len());
        chain.extend(app_middlewares.iter().cloned());
        chain.push(error_boundary());
        chain.extend(self.middlewares.iter().cloned());

        compose(&ctx, &chain, tail)().await
    }
}

/// Walk a controller's handler methods, wiring a pipeline for each one the
/// registry has a route descriptor for.
pub(crate) fn wire_controller(
    controller: Arc<dyn Controller>,
    logger: &Logger,
) -> Result<Vec<Arc<RoutePipeline>>> {
    let controller_name = controller.type_name();
    let type_id = controller.as_any().type_id();

    let mut pipelines = Vec::new();
    for route in Arc::clone(&controller).routes() {
        let Some(meta) = registry::route_meta(type_id, route.name) else {
            continue;
        };

        let name = format!("{controller_name}.{}", route.name);
        if meta.methods.is_empty() {
            return Err(EnsembleError::assembly(format!(
                "route {name}: empty method set"
            )));
        }

        let input = match &meta.input {
            Some(spec) => Some(CompiledInput {
                tap: spec.tap.clone(),
                validator: compile_schema(&spec.schema)
                    .map_err(|e| EnsembleError::assembly(format!("route {name}: {e}")))?,
            }),
            None => None,
        };

        let methods: Vec<String> = meta.methods.iter().map(|m| m.to_string()).collect();
        logger.info(format!(
            "register controller: {} {} -> {name}",
            methods.join(","),
            meta.path
        ));

        pipelines.push(Arc::new(RoutePipeline {
            name,
            path: meta.path.clone(),
            methods: meta.methods.clone(),
            middlewares: meta.middlewares.clone(),
            input,
            invoke: Arc::clone(&route.invoke),
        }));
    }

    Ok(pipelines)
}

/// Shared per-application request state: the app handle, the combined
/// app-level middleware list and the signal observers.
pub(crate) struct HttpEntry {
    pub(crate) handle: AppHandle,
    pub(crate) logger: Logger,
    pub(crate) middlewares: Vec<MiddlewareFn>,
    pub(crate) signals: Arc<Signals>,
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Delete => MethodFilter::DELETE,
    }
}

/// Register every pipeline against the router, one chain per declared
/// method at the same path.
pub(crate) fn build_router(pipelines: &[Arc<RoutePipeline>], entry: &Arc<HttpEntry>) -> Router {
    let mut router = Router::new();
    for pipeline in pipelines {
        let mut method_router = MethodRouter::new();
        for method in &pipeline.methods {
            let pipeline = Arc::clone(pipeline);
            let entry = Arc::clone(entry);
            method_router = method_router.on(
                method_filter(*method),
                move |params: RawPathParams, request: Request| {
                    handle_request(entry.clone(), pipeline.clone(), params, request)
                },
            );
        }
        router = router.route(&pipeline.path, method_router);
    }
    router
}

async fn handle_request(
    entry: Arc<HttpEntry>,
    pipeline: Arc<RoutePipeline>,
    params: RawPathParams,
    request: Request,
) -> Response {
    let ctx = match read_request(&entry, params, request).await {
        Ok(ctx) => Arc::new(ctx),
        Err(error) => return escalate(&entry, &pipeline.name, error),
    };

    let outcome = Arc::clone(&pipeline)
        .dispatch(Arc::clone(&ctx), &entry.middlewares)
        .await;
    match outcome {
        Ok(()) => ctx.into_axum_response(),
        Err(error) => escalate(&entry, &pipeline.name, error),
    }
}

/// Top-level error channel: log, fire the application error signal, answer
/// with a generic failure that leaks no internal detail.
fn escalate(entry: &HttpEntry, route: &str, error: EnsembleError) -> Response {
    entry.logger.error(format!("{route} failed: {error}"));
    entry.signals.emit_error(&error);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

async fn read_request(
    entry: &Arc<HttpEntry>,
    params: RawPathParams,
    request: Request,
) -> Result<Ctx> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let mut param_map = JsonMap::new();
    for (name, value) in params.iter() {
        param_map.insert(name.to_string(), Value::String(value.to_string()));
    }

    let mut query_map = JsonMap::new();
    if let Some(query) = uri.query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            query_map.insert(name.into_owned(), Value::String(value.into_owned()));
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut body = Value::Null;
    let mut files = JsonMap::new();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| anyhow::anyhow!("multipart: {e}"))?;
        let mut fields = JsonMap::new();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| anyhow::anyhow!("multipart: {e}"))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            if let Some(file_name) = field.file_name().map(str::to_string) {
                let part_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| anyhow::anyhow!("multipart: {e}"))?;
                let path =
                    std::env::temp_dir().join(format!("ensemble-upload-{}", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, &data).await?;
                files.insert(
                    name,
                    json!({
                        "path": path.to_string_lossy(),
                        "name": file_name,
                        "content_type": part_type,
                        "size": data.len(),
                    }),
                );
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| anyhow::anyhow!("multipart: {e}"))?;
                fields.insert(name, Value::String(text));
            }
        }

        if !fields.is_empty() {
            body = Value::Object(fields);
        }
    } else if content_type.starts_with("application/json") {
        let bytes = to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| anyhow::anyhow!("read body: {e}"))?;
        if !bytes.is_empty() {
            body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let bytes = to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| anyhow::anyhow!("read body: {e}"))?;
        let mut form = JsonMap::new();
        for (name, value) in url::form_urlencoded::parse(&bytes) {
            form.insert(name.into_owned(), Value::String(value.into_owned()));
        }
        body = Value::Object(form);
    }

    Ok(Ctx {
        app: entry.handle.clone(),
        method,
        path: uri.path().to_string(),
        headers,
        params: param_map,
        query: query_map,
        body,
        files,
        response: Mutex::new(ResponseParts::default()),
    })
}
