//! Middleware chain (C6) — ordered normal + error middleware with explicit
//! `next(err?)` semantics, modelled as an explicit cursor state machine
//! rather than a coroutine stack (spec §9 design note).

use crate::config::{ErrorMiddleware, Middleware};
use crate::error::{EngineError, Result};
use crate::request::Request;
use crate::response::Response;
use std::sync::Arc;

/// Shared mutable state a middleware can use to write an early response.
/// Once `ended` is true, later middlewares in the chain must not write
/// (spec §4.6).
pub struct MiddlewareContext {
    response: Option<Response>,
}

impl MiddlewareContext {
    pub fn new() -> Self {
        MiddlewareContext { response: None }
    }

    /// Sets the response for this request, ending the chain early. A
    /// no-op (silently ignored, mirroring "later middlewares must not
    /// write") if a response was already set.
    pub fn respond(&mut self, response: Response) {
        if self.response.is_none() {
            self.response = Some(response);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.response.is_some()
    }

    pub fn take_response(self) -> Option<Response> {
        self.response
    }
}

impl Default for MiddlewareContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MiddlewareChain {
    normal: Vec<Arc<dyn Middleware>>,
    error: Vec<Arc<dyn ErrorMiddleware>>,
}

pub enum ChainOutcome {
    /// The chain ran to completion (or was ended early by a middleware
    /// writing a response) without an unresolved error.
    Completed(MiddlewareContext),
    /// The error list was exhausted with an unresolved error.
    Failed(EngineError),
}

impl MiddlewareChain {
    pub fn new(normal: Vec<Arc<dyn Middleware>>, error: Vec<Arc<dyn ErrorMiddleware>>) -> Self {
        MiddlewareChain { normal, error }
    }

    /// Runs the chain to completion. Cursor into each list advances
    /// independently; `next(err)` (a middleware returning `Err`) jumps
    /// into the error list at its *current* cursor position, matching the
    /// the state machine described in spec §9.
    pub async fn run(&self, req: &mut Request) -> ChainOutcome {
        let mut ctx = MiddlewareContext::new();
        let mut normal_idx = 0usize;
        let mut error_idx = 0usize;
        let mut pending_err: Option<EngineError> = None;

        loop {
            if ctx.is_ended() {
                return ChainOutcome::Completed(ctx);
            }

            match pending_err.take() {
                None => {
                    if normal_idx >= self.normal.len() {
                        return ChainOutcome::Completed(ctx);
                    }
                    let mw = &self.normal[normal_idx];
                    normal_idx += 1;
                    match mw.call(req, &mut ctx).await {
                        Ok(()) => continue,
                        Err(e) => {
                            pending_err = Some(e);
                            continue;
                        }
                    }
                }
                Some(err) => {
                    if error_idx >= self.error.len() {
                        return ChainOutcome::Failed(err);
                    }
                    let mw = &self.error[error_idx];
                    error_idx += 1;
                    match mw.call(&err, req, &mut ctx).await {
                        Ok(()) => {
                            if ctx.is_ended() {
                                return ChainOutcome::Completed(ctx);
                            }
                            // Error resolved without writing: fall back to
                            // the normal list is *not* specified; per spec
                            // an error middleware has "first refusal" —
                            // resolving without responding means the
                            // dispatcher proceeds as if nothing happened.
                            return ChainOutcome::Completed(ctx);
                        }
                        Err(new_err) => {
                            pending_err = Some(new_err);
                            continue;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Method, Request};

    struct RespondingMiddleware;
    #[async_trait::async_trait]
    impl Middleware for RespondingMiddleware {
        async fn call(&self, _req: &mut Request, ctx: &mut MiddlewareContext) -> Result<()> {
            ctx.respond(Response::new(204));
            Ok(())
        }
    }

    struct FailingMiddleware;
    #[async_trait::async_trait]
    impl Middleware for FailingMiddleware {
        async fn call(&self, _req: &mut Request, _ctx: &mut MiddlewareContext) -> Result<()> {
            Err(EngineError::client(400, "nope"))
        }
    }

    struct NextMiddleware;
    #[async_trait::async_trait]
    impl Middleware for NextMiddleware {
        async fn call(&self, _req: &mut Request, _ctx: &mut MiddlewareContext) -> Result<()> {
            Ok(())
        }
    }

    struct ResolvingErrorMiddleware;
    #[async_trait::async_trait]
    impl crate::config::ErrorMiddleware for ResolvingErrorMiddleware {
        async fn call(&self, _err: &EngineError, _req: &mut Request, ctx: &mut MiddlewareContext) -> Result<()> {
            ctx.respond(Response::new(200));
            Ok(())
        }
    }

    #[tokio::test]
    async fn middleware_writing_response_ends_chain_early() {
        let chain = MiddlewareChain::new(vec![Arc::new(RespondingMiddleware), Arc::new(NextMiddleware)], Vec::new());
        let mut req = Request::new(Method::Get, "/x");
        match chain.run(&mut req).await {
            ChainOutcome::Completed(ctx) => assert_eq!(ctx.take_response().unwrap().status, 204),
            ChainOutcome::Failed(_) => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn error_with_no_error_middlewares_fails_the_chain() {
        let chain = MiddlewareChain::new(vec![Arc::new(FailingMiddleware)], Vec::new());
        let mut req = Request::new(Method::Get, "/x");
        match chain.run(&mut req).await {
            ChainOutcome::Failed(_) => {}
            ChainOutcome::Completed(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn error_middleware_can_resolve_and_respond() {
        let chain = MiddlewareChain::new(
            vec![Arc::new(FailingMiddleware)],
            vec![Arc::new(ResolvingErrorMiddleware)],
        );
        let mut req = Request::new(Method::Get, "/x");
        match chain.run(&mut req).await {
            ChainOutcome::Completed(ctx) => assert_eq!(ctx.take_response().unwrap().status, 200),
            ChainOutcome::Failed(_) => panic!("expected completion"),
        }
    }
}
