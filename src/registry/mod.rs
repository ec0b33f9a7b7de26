//! Metadata registry.
//!
//! A process-wide table associating declarative route and lifecycle metadata
//! with `(declaring type, method name)` pairs. Attachment happens once, when
//! a type's `describe` registration runs; lookup happens during assembly as
//! each instantiated object's method names are walked. There is no removal:
//! the registry is created once and never reset.

use crate::lifecycle::Phase;
use crate::pipeline::MiddlewareFn;
use crate::util::try_parse_number_properties;
use dashmap::DashMap;
use serde_json::Value;
use std::any::TypeId;
use std::sync::{Arc, LazyLock};

/// HTTP methods a route may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A pre-validation transform applied to assembled route input.
#[derive(Clone)]
pub enum Tap {
    /// A supplied transform function.
    Fn(Arc<dyn Fn(Value) -> Value + Send + Sync>),
    /// The named built-in: coerce every top-level property to a number when
    /// parseable, leaving non-numeric values untouched.
    ParseNumbers,
}

impl Tap {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Tap::Fn(Arc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        match self {
            Tap::Fn(f) => f(value),
            Tap::ParseNumbers => try_parse_number_properties(value),
        }
    }
}

/// Input assembly and validation settings for a route.
#[derive(Clone)]
pub struct InputSpec {
    pub tap: Option<Tap>,
    pub schema: Value,
}

impl InputSpec {
    pub fn schema(schema: Value) -> Self {
        Self { tap: None, schema }
    }

    pub fn with_tap(mut self, tap: Tap) -> Self {
        self.tap = Some(tap);
        self
    }
}

/// Declarative record of a controller method's path, allowed methods,
/// middlewares and input handling. Immutable once attached.
#[derive(Clone)]
pub struct RouteMeta {
    pub path: String,
    pub methods: Vec<HttpMethod>,
    pub middlewares: Vec<MiddlewareFn>,
    pub input: Option<InputSpec>,
}

impl RouteMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            methods: Vec::new(),
            middlewares: Vec::new(),
            input: None,
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.methods.extend(methods);
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.input = Some(input);
        self
    }
}

type MetaKey = (TypeId, &'static str);

struct MetaRegistry {
    routes: DashMap<MetaKey, Arc<RouteMeta>>,
    lifecycles: DashMap<MetaKey, Phase>,
}

static REGISTRY: LazyLock<MetaRegistry> = LazyLock::new(|| MetaRegistry {
    routes: DashMap::new(),
    lifecycles: DashMap::new(),
});

/// Attach a route descriptor to `(T, method_name)`. The first attachment per
/// pair wins; repeats are ignored.
pub fn attach_route<T: 'static>(method_name: &'static str, meta: RouteMeta) {
    REGISTRY
        .routes
        .entry((TypeId::of::<T>(), method_name))
        .or_insert_with(|| Arc::new(meta));
}

pub fn route_meta(type_id: TypeId, method_name: &'static str) -> Option<Arc<RouteMeta>> {
    REGISTRY
        .routes
        .get(&(type_id, method_name))
        .map(|e| Arc::clone(e.value()))
}

/// Tag `(T, method_name)` as a lifecycle hook. At most one phase per method;
/// the first attachment wins.
pub fn attach_lifecycle<T: 'static>(method_name: &'static str, phase: Phase) {
    REGISTRY
        .lifecycles
        .entry((TypeId::of::<T>(), method_name))
        .or_insert(phase);
}

pub fn lifecycle_meta(type_id: TypeId, method_name: &'static str) -> Option<Phase> {
    REGISTRY
        .lifecycles
        .get(&(type_id, method_name))
        .map(|e| *e.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Probe;
    struct Unregistered;

    #[test]
    fn route_attachment_is_first_wins() {
        attach_route::<Probe>(
            "list",
            RouteMeta::new("/probe").method(HttpMethod::Get),
        );
        attach_route::<Probe>(
            "list",
            RouteMeta::new("/other").method(HttpMethod::Post),
        );

        let meta = route_meta(TypeId::of::<Probe>(), "list").unwrap();
        assert_eq!(meta.path, "/probe");
        assert_eq!(meta.methods, vec![HttpMethod::Get]);

        assert!(route_meta(TypeId::of::<Unregistered>(), "list").is_none());
        assert!(route_meta(TypeId::of::<Probe>(), "missing").is_none());
    }

    #[test]
    fn lifecycle_tags_resolve_per_method() {
        attach_lifecycle::<Probe>("warmup", Phase::Setup);
        attach_lifecycle::<Probe>("drain", Phase::Close);

        assert_eq!(
            lifecycle_meta(TypeId::of::<Probe>(), "warmup"),
            Some(Phase::Setup)
        );
        assert_eq!(
            lifecycle_meta(TypeId::of::<Probe>(), "drain"),
            Some(Phase::Close)
        );
        assert_eq!(lifecycle_meta(TypeId::of::<Probe>(), "other"), None);
    }

    #[test]
    fn parse_numbers_tap_coerces_only_numeric_strings() {
        let tap = Tap::ParseNumbers;
        let out = tap.apply(json!({"pageNum": "1", "title": "aaa"}));
        assert_eq!(out, json!({"pageNum": 1, "title": "aaa"}));
    }

    #[test]
    fn custom_tap_function_applies() {
        let tap = Tap::func(|mut v| {
            v["extra"] = json!(true);
            v
        });
        let out = tap.apply(json!({}));
        assert_eq!(out, json!({"extra": true}));
    }
}
