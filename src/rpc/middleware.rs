//! Request handling stacks.
//!
//! Incoming requests run through the [WILDCARD] stack then the stack registered
//! under their method name. The first reply ends the chain. If a middleware fails,
//! or the chain ends without a reply, the error handler stacks run in the same order.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

use serde_json::Value;
use tracing::debug;

use crate::common::{Contact, Id, RoutingTable, Storage};

use super::RpcError;

/// Scope of middlewares that run for every method.
pub const WILDCARD: &str = "*";

/// JSON-RPC error code of [Response::error] when none is given.
pub const DEFAULT_ERROR_CODE: i64 = -32000;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;
pub const INTERNAL_ERROR_CODE: i64 = -32603;

#[derive(Debug, Clone, PartialEq)]
/// An incoming call.
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Value,
    /// The node that sent this request.
    pub contact: Contact,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error { message: String, code: i64 },
}

#[derive(Debug, Default)]
/// Collects the single reply to a [Request].
pub struct Response {
    reply: Option<Reply>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with a result. Ignored if a reply was already given.
    pub fn send(&mut self, result: Value) {
        if self.reply.is_none() {
            self.reply = Some(Reply::Result(result));
        }
    }

    /// Reply with an error, `code` defaults to [DEFAULT_ERROR_CODE].
    /// Ignored if a reply was already given.
    pub fn error(&mut self, message: impl Into<String>, code: Option<i64>) {
        if self.reply.is_none() {
            self.reply = Some(Reply::Error {
                message: message.into(),
                code: code.unwrap_or(DEFAULT_ERROR_CODE),
            });
        }
    }

    pub fn is_sent(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    pub fn into_reply(self) -> Option<Reply> {
        self.reply
    }
}

/// What handlers get to see and touch of the node.
pub struct Context<'a> {
    pub identity: &'a Id,
    pub contact: &'a Contact,
    pub routing_table: &'a RoutingTable,
    pub storage: &'a mut dyn Storage,
}

/// A request handler.
///
/// Returning an error halts the chain and hands the error to the error handlers.
pub trait Middleware: Send {
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), RpcError>;
}

impl<F> Middleware for F
where
    F: FnMut(&mut Context<'_>, &Request, &mut Response) -> Result<(), RpcError> + Send,
{
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), RpcError> {
        self(ctx, request, response)
    }
}

/// An error handler, `error` is `None` when no middleware replied.
pub trait ErrorMiddleware: Send {
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        error: Option<&RpcError>,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), RpcError>;
}

impl<F> ErrorMiddleware for F
where
    F: FnMut(&mut Context<'_>, Option<&RpcError>, &Request, &mut Response) -> Result<(), RpcError>
        + Send,
{
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        error: Option<&RpcError>,
        request: &Request,
        response: &mut Response,
    ) -> Result<(), RpcError> {
        self(ctx, error, request, response)
    }
}

/// Replies "Method not found" to requests nothing replied to.
pub fn method_not_found(
    _ctx: &mut Context<'_>,
    error: Option<&RpcError>,
    _request: &Request,
    response: &mut Response,
) -> Result<(), RpcError> {
    if error.is_none() {
        response.error("Method not found", Some(METHOD_NOT_FOUND_CODE));
    }

    Ok(())
}

/// Replies with the message of the error that halted the chain.
pub fn internal_error(
    _ctx: &mut Context<'_>,
    error: Option<&RpcError>,
    _request: &Request,
    response: &mut Response,
) -> Result<(), RpcError> {
    if let Some(error) = error {
        response.error(error.to_string(), Some(error.code()));
    }

    Ok(())
}

#[derive(Default)]
pub(crate) struct Stacks {
    middlewares: HashMap<String, Vec<Box<dyn Middleware>>>,
    error_handlers: HashMap<String, Vec<Box<dyn ErrorMiddleware>>>,
}

impl Stacks {
    pub fn push_middleware(&mut self, method: &str, middleware: Box<dyn Middleware>) {
        self.middlewares
            .entry(method.to_string())
            .or_default()
            .push(middleware);
    }

    pub fn push_error_handler(&mut self, method: &str, handler: Box<dyn ErrorMiddleware>) {
        self.error_handlers
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    pub fn dispatch(&mut self, ctx: &mut Context<'_>, request: &Request, response: &mut Response) {
        let method = (request.method != WILDCARD).then_some(request.method.as_str());
        let scopes: Vec<&str> = std::iter::once(WILDCARD).chain(method).collect();

        let mut error = None;

        'chain: for scope in &scopes {
            for middleware in self.middlewares.get_mut(*scope).into_iter().flatten() {
                if let Err(e) = middleware.handle(ctx, request, response) {
                    error = Some(e);
                    break 'chain;
                }

                if response.is_sent() {
                    return;
                }
            }
        }

        for scope in &scopes {
            for handler in self.error_handlers.get_mut(*scope).into_iter().flatten() {
                if let Err(e) = handler.handle(ctx, error.as_ref(), request, response) {
                    debug!(context = "rpc_middleware", method = %request.method, error = ?e, "Error handler failed");
                    return;
                }

                if response.is_sent() {
                    return;
                }
            }
        }
    }
}

impl Debug for Stacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.middlewares.keys().collect();
        methods.sort();

        f.debug_struct("Stacks").field("methods", &methods).finish()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::common::MemoryStorage;

    use super::*;

    fn run(stacks: &mut Stacks, method: &str) -> Option<Reply> {
        let id = Id::random();
        let contact = Contact::random();
        let routing_table = RoutingTable::new(id);
        let mut storage = MemoryStorage::default();

        let mut ctx = Context {
            identity: &id,
            contact: &contact,
            routing_table: &routing_table,
            storage: &mut storage,
        };
        let request = Request {
            id: "1".into(),
            method: method.into(),
            params: json!([]),
            contact: Contact::random(),
        };
        let mut response = Response::new();

        stacks.dispatch(&mut ctx, &request, &mut response);

        response.into_reply()
    }

    fn with_error_rules() -> Stacks {
        let mut stacks = Stacks::default();
        stacks.push_error_handler(WILDCARD, Box::new(method_not_found));
        stacks.push_error_handler(WILDCARD, Box::new(internal_error));
        stacks
    }

    #[test]
    fn method_not_found_without_handlers() {
        let mut stacks = with_error_rules();

        assert_eq!(
            run(&mut stacks, "ECHO"),
            Some(Reply::Error {
                message: "Method not found".into(),
                code: METHOD_NOT_FOUND_CODE
            })
        );
    }

    #[test]
    fn wildcard_runs_first_and_reply_ends_chain() {
        let mut stacks = with_error_rules();

        stacks.push_middleware(
            "ECHO",
            Box::new(
                |_: &mut Context<'_>, _: &Request, response: &mut Response| -> Result<(), RpcError> {
                    response.send(json!("method"));
                    Ok(())
                },
            ),
        );
        stacks.push_middleware(
            WILDCARD,
            Box::new(
                |_: &mut Context<'_>, request: &Request, response: &mut Response| -> Result<(), RpcError> {
                    if request.method == "HALT" {
                        response.send(json!("wildcard"));
                    }
                    Ok(())
                },
            ),
        );

        assert_eq!(run(&mut stacks, "ECHO"), Some(Reply::Result(json!("method"))));
        assert_eq!(run(&mut stacks, "HALT"), Some(Reply::Result(json!("wildcard"))));
    }

    #[test]
    fn errors_reach_error_handlers() {
        let mut stacks = with_error_rules();

        stacks.push_middleware(
            WILDCARD,
            Box::new(
                |_: &mut Context<'_>, request: &Request, _: &mut Response| -> Result<(), RpcError> {
                    if request.method == "STORE" {
                        return Err(RpcError::InvalidParams("Invalid item key supplied".into()));
                    }
                    Ok(())
                },
            ),
        );
        stacks.push_middleware(
            "STORE",
            Box::new(
                |_: &mut Context<'_>, _: &Request, response: &mut Response| -> Result<(), RpcError> {
                    response.send(json!("unreachable"));
                    Ok(())
                },
            ),
        );

        assert_eq!(
            run(&mut stacks, "STORE"),
            Some(Reply::Error {
                message: "Invalid item key supplied".into(),
                code: INTERNAL_ERROR_CODE
            })
        );
    }

    #[test]
    fn wildcard_error_handlers_run_first() {
        let mut stacks = Stacks::default();

        stacks.push_error_handler(
            "ECHO",
            Box::new(
                |_: &mut Context<'_>,
                 error: Option<&RpcError>,
                 _: &Request,
                 response: &mut Response|
                 -> Result<(), RpcError> {
                    if error.is_none() {
                        response.error("No echo today", None);
                    }
                    Ok(())
                },
            ),
        );
        stacks.push_error_handler(WILDCARD, Box::new(internal_error));
        stacks.push_error_handler(WILDCARD, Box::new(method_not_found));

        assert_eq!(
            run(&mut stacks, "ECHO"),
            Some(Reply::Error {
                message: "Method not found".into(),
                code: METHOD_NOT_FOUND_CODE
            })
        );

        let mut stacks = Stacks::default();
        stacks.push_error_handler(
            "ECHO",
            Box::new(
                |_: &mut Context<'_>,
                 _: Option<&RpcError>,
                 _: &Request,
                 response: &mut Response|
                 -> Result<(), RpcError> {
                    response.error("No echo today", None);
                    Ok(())
                },
            ),
        );

        assert_eq!(
            run(&mut stacks, "ECHO"),
            Some(Reply::Error {
                message: "No echo today".into(),
                code: DEFAULT_ERROR_CODE
            })
        );
    }

    #[test]
    fn first_reply_wins() {
        let mut response = Response::new();

        response.send(json!(1));
        response.error("late", None);
        response.send(json!(2));

        assert_eq!(response.reply(), Some(&Reply::Result(json!(1))));
    }
}
