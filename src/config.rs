//! Plugin options, handler descriptors, pagination/filter configs — spec §3.
//! `Options`/`HandlerDescriptor` hold `Arc<dyn Trait>` execution hooks and so
//! cannot derive `Deserialize` themselves; [`OptionsDto`]/[`HandlerDescriptorDto`]
//! are the plain `serde::Deserialize` shapes an embedding host loads from JSON
//! or TOML, converted via `From` into the runtime types. The crate itself
//! never reads a config file (that's host plumbing, out of scope per spec §1).

use crate::request::Method;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedAction {
    #[serde(rename = "404")]
    NotFound,
    Forward,
}

impl Default for UnmatchedAction {
    fn default() -> Self {
        UnmatchedAction::NotFound
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaginationMode {
    Exclusive,
    Inclusive,
    None,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PaginationSource {
    QueryParam,
    Body,
}

/// Pagination config (P) — spec §3, §4.4.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct PaginationConfig {
    pub source: Option<PaginationSource>,
    pub root: Option<String>,
    pub limit_field: Option<String>,
    pub skip_field: Option<String>,
    pub sort_field: Option<String>,
    pub order_field: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum ValueType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "number[]")]
    NumberArray,
    #[serde(rename = "boolean[]")]
    BooleanArray,
    #[serde(rename = "date[]")]
    DateArray,
    #[serde(rename = "function")]
    Function,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Nin,
    Regex,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FilterRule {
    pub key: String,
    #[serde(rename = "valueType")]
    pub value_type: ValueType,
    pub comparison: Comparison,
    #[serde(rename = "regexFlags")]
    pub regex_flags: Option<String>,
}

/// Filter config (F) — spec §3, §4.4.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct FilterConfig {
    pub source: Option<PaginationSource>,
    pub root: Option<String>,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl Default for PaginationMode {
    fn default() -> Self {
        PaginationMode::Inclusive
    }
}

/// One axis (pagination or filter) of a handler's or the global config,
/// carrying its own exclusive/inclusive/none mode — spec §4.4.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct AxisSetting<T> {
    #[serde(default)]
    pub mode: PaginationMode,
    #[serde(default)]
    pub config: Option<T>,
}

/// Per-handler or per-method pagination/filter settings — spec §4.4 and
/// the GLOSSARY's exclusive/inclusive/none.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct AxisConfig {
    #[serde(default)]
    pub pagination: AxisSetting<PaginationConfig>,
    #[serde(default)]
    pub filter: AxisSetting<FilterConfig>,
}

pub type PreTransform = PreTransformKind;

#[derive(Clone)]
pub enum PreTransformKind {
    Replace(Vec<(String, String)>),
    Function(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl std::fmt::Debug for PreTransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreTransformKind::Replace(v) => f.debug_tuple("Replace").field(v).finish(),
            PreTransformKind::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Execution mode of a handler descriptor — spec §3 "execution mode".
#[derive(Clone)]
pub enum HandlerKind {
    /// Custom function `(req) -> Response`, called directly.
    Custom(Arc<dyn CustomHandler>),
    /// Delegates to the filesystem request engine, with optional
    /// pre/post transforms.
    FilesystemDelegate {
        pre_transform: Option<PreTransformKind>,
        post_handler: Option<Arc<dyn PostHandler>>,
    },
}

impl std::fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerKind::Custom(_) => f.write_str("Custom(..)"),
            HandlerKind::FilesystemDelegate { pre_transform, .. } => f
                .debug_struct("FilesystemDelegate")
                .field("pre_transform", pre_transform)
                .finish(),
        }
    }
}

/// A handler's custom function. Must write a response to be considered
/// successful (spec §4.7 step 3).
#[async_trait::async_trait]
pub trait CustomHandler: Send + Sync {
    async fn call(&self, req: &mut crate::request::Request) -> crate::error::Result<crate::response::Response>;
}

/// Hook invoked after the engine reads the resolved file (or `None`); must
/// produce the full response (spec §4.7 "Post-transform").
#[async_trait::async_trait]
pub trait PostHandler: Send + Sync {
    async fn call(
        &self,
        req: &mut crate::request::Request,
        file_bytes: Option<Vec<u8>>,
    ) -> crate::error::Result<crate::response::Response>;
}

/// Handler descriptor (H) — spec §3. Immutable after startup.
#[derive(Clone, Debug)]
pub struct HandlerDescriptor {
    pub pattern: String,
    pub method: Method,
    pub disabled: bool,
    pub kind: HandlerKind,
    pub delay_ms: Option<u64>,
    pub pagination_filter: AxisConfig,
}

impl HandlerDescriptor {
    pub fn filesystem(pattern: impl Into<String>, method: Method) -> Self {
        HandlerDescriptor {
            pattern: pattern.into(),
            method,
            disabled: false,
            kind: HandlerKind::FilesystemDelegate { pre_transform: None, post_handler: None },
            delay_ms: None,
            pagination_filter: AxisConfig::default(),
        }
    }

    pub fn custom(pattern: impl Into<String>, method: Method, handler: Arc<dyn CustomHandler>) -> Self {
        HandlerDescriptor {
            pattern: pattern.into(),
            method,
            disabled: false,
            kind: HandlerKind::Custom(handler),
            delay_ms: None,
            pagination_filter: AxisConfig::default(),
        }
    }
}

/// Normal middleware: `(req, res, next)`. `ctx` is where a middleware
/// writes an early response; returning `Err` is equivalent to calling
/// `next(err)` (spec §4.6).
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn call(
        &self,
        req: &mut crate::request::Request,
        ctx: &mut crate::middleware::MiddlewareContext,
    ) -> crate::error::Result<()>;
}

/// Error middleware: `(err, req, res, next)`. May resolve the error (return
/// `Ok`) or replace it (return a new `Err`).
#[async_trait::async_trait]
pub trait ErrorMiddleware: Send + Sync {
    async fn call(
        &self,
        err: &crate::error::EngineError,
        req: &mut crate::request::Request,
        ctx: &mut crate::middleware::MiddlewareContext,
    ) -> crate::error::Result<()>;
}

/// Plugin options (O) — spec §3. Immutable after init.
#[derive(Clone)]
pub struct Options {
    pub endpoint_prefixes: Vec<String>,
    pub fs_root: Option<PathBuf>,
    pub delay_ms: Option<u64>,
    pub gateway_timeout_ms: u64,
    pub parser_enabled: bool,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub error_middlewares: Vec<Arc<dyn ErrorMiddleware>>,
    pub handlers: Vec<HandlerDescriptor>,
    pub unmatched_action: UnmatchedAction,
    /// Global pagination/filter config keyed by method name, or "ALL".
    pub global_axis: std::collections::HashMap<String, AxisConfig>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            endpoint_prefixes: vec!["/api".to_string()],
            fs_root: None,
            delay_ms: None,
            gateway_timeout_ms: 0,
            parser_enabled: true,
            middlewares: Vec::new(),
            error_middlewares: Vec::new(),
            handlers: Vec::new(),
            unmatched_action: UnmatchedAction::NotFound,
            global_axis: std::collections::HashMap::new(),
        }
    }
}

impl Options {
    /// Normalizes the prefix list; an empty result disables the engine
    /// (spec §3 invariant).
    pub fn normalized_prefixes(&self) -> Vec<String> {
        self.endpoint_prefixes
            .iter()
            .filter(|p| !p.is_empty() && p.starts_with('/'))
            .cloned()
            .collect()
    }

    pub fn is_disabled(&self) -> bool {
        self.normalized_prefixes().is_empty()
    }

    /// Which configured prefix, if any, matches `url`.
    pub fn matching_prefix(&self, url: &str) -> Option<String> {
        self.normalized_prefixes()
            .into_iter()
            .find(|p| url == p || url.starts_with(&format!("{p}/")))
    }

    pub fn axis_for(&self, method: Method) -> Option<&AxisConfig> {
        self.global_axis
            .get(method.as_str())
            .or_else(|| self.global_axis.get("ALL"))
    }
}

fn default_endpoint_prefixes() -> Vec<String> {
    vec!["/api".to_string()]
}

fn default_true() -> bool {
    true
}

/// Deserializable counterpart to [`HandlerDescriptor`]: every declarative
/// field, minus `kind`, which a DTO has no way to represent (a `Custom`
/// handler is a Rust closure, not data). Converting always produces a
/// `FilesystemDelegate` with no pre/post transform — a host that needs a
/// custom handler builds the `HandlerDescriptor` directly instead of
/// through this DTO.
#[derive(Clone, Debug, Deserialize)]
pub struct HandlerDescriptorDto {
    pub pattern: String,
    pub method: Method,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub pagination_filter: AxisConfig,
}

impl From<HandlerDescriptorDto> for HandlerDescriptor {
    fn from(dto: HandlerDescriptorDto) -> Self {
        HandlerDescriptor {
            pattern: dto.pattern,
            method: dto.method,
            disabled: dto.disabled,
            kind: HandlerKind::FilesystemDelegate { pre_transform: None, post_handler: None },
            delay_ms: dto.delay_ms,
            pagination_filter: dto.pagination_filter,
        }
    }
}

/// Deserializable counterpart to [`Options`]: every declarative field,
/// minus `middlewares`/`error_middlewares`, which are `Arc<dyn Trait>` and
/// so have no data representation — a converted `Options` always starts
/// with both empty, and the host appends middleware programmatically
/// after conversion.
#[derive(Clone, Debug, Deserialize)]
pub struct OptionsDto {
    #[serde(default = "default_endpoint_prefixes")]
    pub endpoint_prefixes: Vec<String>,
    #[serde(default)]
    pub fs_root: Option<PathBuf>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub gateway_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub parser_enabled: bool,
    #[serde(default)]
    pub handlers: Vec<HandlerDescriptorDto>,
    #[serde(default)]
    pub unmatched_action: UnmatchedAction,
    #[serde(default)]
    pub global_axis: std::collections::HashMap<String, AxisConfig>,
}

impl From<OptionsDto> for Options {
    fn from(dto: OptionsDto) -> Self {
        Options {
            endpoint_prefixes: dto.endpoint_prefixes,
            fs_root: dto.fs_root,
            delay_ms: dto.delay_ms,
            gateway_timeout_ms: dto.gateway_timeout_ms,
            parser_enabled: dto.parser_enabled,
            middlewares: Vec::new(),
            error_middlewares: Vec::new(),
            handlers: dto.handlers.into_iter().map(HandlerDescriptor::from).collect(),
            unmatched_action: dto.unmatched_action,
            global_axis: dto.global_axis,
        }
    }
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn options_dto_deserializes_from_json_and_converts() {
        let json = r#"{
            "endpoint_prefixes": ["/api"],
            "handlers": [
                {"pattern": "/widgets", "method": "get"}
            ]
        }"#;
        let dto: OptionsDto = serde_json::from_str(json).unwrap();
        let options: Options = dto.into();
        assert_eq!(options.endpoint_prefixes, vec!["/api".to_string()]);
        assert_eq!(options.handlers.len(), 1);
        assert_eq!(options.handlers[0].method, Method::Get);
        assert!(matches!(options.handlers[0].kind, HandlerKind::FilesystemDelegate { .. }));
    }

    #[test]
    fn options_dto_defaults_when_fields_absent() {
        let dto: OptionsDto = serde_json::from_str("{}").unwrap();
        assert_eq!(dto.endpoint_prefixes, vec!["/api".to_string()]);
        assert!(dto.parser_enabled);
        assert!(dto.handlers.is_empty());
    }
}
