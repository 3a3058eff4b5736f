//! REST dispatcher (C7) — spec §4.7. Selects a handler, runs the
//! middleware chain, delegates to a custom function or the filesystem
//! engine, and applies the gateway timeout across the whole pipeline.

use crate::config::{HandlerKind, Options, PreTransformKind, UnmatchedAction};
use crate::error::{EngineError, Result};
use crate::fs_engine;
use crate::middleware::{ChainOutcome, MiddlewareChain};
use crate::pagination::{self, ResolvedAxis};
use crate::path_matcher;
use crate::request::{Method, Request};
use crate::response::Response;
use std::time::Duration;
use tracing::debug;

pub enum DispatchOutcome {
    Response(Response),
    /// `noHandledRestFsRequestsAction = "forward"`: relinquish control to
    /// the embedding host's next middleware.
    Forward,
}

pub struct Engine {
    pub options: Options,
}

impl Engine {
    pub fn new(options: Options) -> Self {
        Engine { options }
    }

    /// Host entrypoint `handleHttp(req, res, next)`: `DispatchOutcome::Forward`
    /// is the `next()` case, a response is the "we handled it" case.
    pub async fn dispatch(&self, mut req: Request) -> DispatchOutcome {
        if self.options.is_disabled() {
            return DispatchOutcome::Forward;
        }

        let Some(prefix) = self.options.matching_prefix(&req.url) else {
            return self.unmatched(&req, EngineError::NoHandler);
        };

        let stripped = strip_prefix(&req.path, &prefix);

        let gateway_timeout = self.options.gateway_timeout_ms;
        let result = if gateway_timeout > 0 {
            match tokio::time::timeout(
                Duration::from_millis(gateway_timeout),
                self.dispatch_inner(&mut req, &stripped, &prefix),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(EngineError::Timeout),
            }
        } else {
            self.dispatch_inner(&mut req, &stripped, &prefix).await
        };

        match result {
            Ok(Some(resp)) => DispatchOutcome::Response(resp),
            Ok(None) => self.unmatched(&req, EngineError::NoHandler),
            Err(e) => DispatchOutcome::Response(Response::error_envelope(&e, &req.path)),
        }
    }

    fn unmatched(&self, req: &Request, err: EngineError) -> DispatchOutcome {
        match self.options.unmatched_action {
            UnmatchedAction::Forward => DispatchOutcome::Forward,
            UnmatchedAction::NotFound => {
                DispatchOutcome::Response(Response::error_envelope(&err, &req.path))
            }
        }
    }

    /// Returns `Ok(None)` when no handler matched and the pure filesystem
    /// path also reports "not found" — the caller then falls through to
    /// the unmatched-request action.
    async fn dispatch_inner(
        &self,
        req: &mut Request,
        stripped_path: &str,
        _prefix: &str,
    ) -> Result<Option<Response>> {
        for handler in &self.options.handlers {
            if handler.method != req.method {
                continue;
            }
            let Some(params) = path_matcher::match_pattern(&handler.pattern, stripped_path) else {
                continue;
            };
            if handler.disabled {
                debug!(pattern = %handler.pattern, "skipping disabled handler");
                continue;
            }
            req.path_params = params;
            return self.run_matched(req, handler, stripped_path).await.map(Some);
        }

        // No declared handler matched; fall through to the pure
        // filesystem path (spec §4.7 step 4).
        match self.run_filesystem(req, stripped_path, None).await {
            Ok(resp) => Ok(Some(resp)),
            Err(EngineError::NotFound { .. }) | Err(EngineError::NoHandler) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_matched(
        &self,
        req: &mut Request,
        handler: &crate::config::HandlerDescriptor,
        stripped_path: &str,
    ) -> Result<Response> {
        let chain = MiddlewareChain::new(self.options.middlewares.clone(), self.options.error_middlewares.clone());
        match chain.run(req).await {
            ChainOutcome::Failed(e) => return Err(EngineError::MiddlewareError(e.message())),
            ChainOutcome::Completed(ctx) => {
                if let Some(resp) = ctx.take_response() {
                    return Ok(resp);
                }
            }
        }

        self.parse_body(req).await?;

        let delay = handler.delay_ms.or(self.options.delay_ms);
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        match &handler.kind {
            HandlerKind::Custom(custom) => custom.call(req).await,
            HandlerKind::FilesystemDelegate { pre_transform, post_handler } => {
                self.run_filesystem(req, stripped_path, Some((pre_transform, post_handler, &handler.pagination_filter)))
                    .await
            }
        }
    }

    async fn parse_body(&self, req: &mut Request) -> Result<()> {
        if !self.options.parser_enabled {
            return Ok(());
        }
        let content_type = req.content_type().map(|s| s.to_string());
        let (body, files) = crate::body::parse(content_type.as_deref(), req.raw_body()).await?;
        req.body = body;
        req.files = files;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    async fn run_filesystem(
        &self,
        req: &mut Request,
        stripped_path: &str,
        handler_ctx: Option<(
            &Option<PreTransformKind>,
            &Option<std::sync::Arc<dyn crate::config::PostHandler>>,
            &crate::config::AxisConfig,
        )>,
    ) -> Result<Response> {
        let Some(root) = self.options.fs_root.as_deref() else {
            return Err(EngineError::Internal(
                "filesystem root not configured for filesystem-delegate handler".to_string(),
            ));
        };

        let (pre_transform, post_handler, axis_cfg) = match handler_ctx {
            Some((pre, post, axis)) => (pre.as_ref(), post.as_ref(), Some(axis)),
            None => (None, None, None),
        };

        let resolved_path = match pre_transform {
            Some(PreTransformKind::Replace(rules)) => {
                let mut p = stripped_path.to_string();
                for (search, replace) in rules {
                    p = p.replace(search, replace);
                }
                p
            }
            Some(PreTransformKind::Function(f)) => f(stripped_path),
            None => stripped_path.to_string(),
        };

        if let Some(post) = post_handler {
            let file_bytes = match crate::fs_resolver::resolve(root, &resolved_path) {
                Some(r) => tokio::fs::read(&r.path).await.ok(),
                None => None,
            };
            // A post-transform hook that wants to signal "I did not
            // respond" returns `Err(EngineError::ManuallyHandled)`
            // itself — Rust's type system already forces every other
            // path to produce a `Response`.
            return post.call(req, file_bytes).await;
        }

        let global_axis = self.options.axis_for(req.method);
        let axis: ResolvedAxis = match axis_cfg {
            Some(cfg) => pagination::resolve(cfg, global_axis),
            None => pagination::resolve(&crate::config::AxisConfig::default(), global_axis),
        };

        match req.method {
            Method::Head | Method::Get => fs_engine::handle_read(req.method, req, root, &resolved_path, &axis).await,
            Method::Post => fs_engine::handle_post(req, root, &resolved_path, &axis).await,
            Method::Put => fs_engine::handle_put(req, root, &resolved_path).await,
            Method::Patch => fs_engine::handle_patch(req, root, &resolved_path).await,
            Method::Delete => fs_engine::handle_delete(req, root, &resolved_path, &axis).await,
            Method::Options => fs_engine::handle_options(),
        }
    }
}

fn strip_prefix(path: &str, prefix: &str) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}
