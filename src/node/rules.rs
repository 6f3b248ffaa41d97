//! Handlers of the Kademlia protocol methods.

use std::str::FromStr;

use serde_json::{json, Value};

use crate::common::{Id, StorageItem};
use crate::rpc::{Context, Middleware, Request, Response, RpcError};

pub const PING: &str = "PING";
pub const STORE: &str = "STORE";
pub const FIND_NODE: &str = "FIND_NODE";
pub const FIND_VALUE: &str = "FIND_VALUE";

/// Replies with an empty list, the sender gets admitted to the routing table
/// like any other sender.
pub fn ping(_ctx: &mut Context<'_>, _request: &Request, response: &mut Response) -> Result<(), RpcError> {
    response.send(json!([]));

    Ok(())
}

/// `[key, item]`: stores `item` under `key` and echoes both back.
pub fn store(ctx: &mut Context<'_>, request: &Request, response: &mut Response) -> Result<(), RpcError> {
    let key = request.params.get(0);
    let item = request.params.get(1);

    let Some(fields) = item.and_then(Value::as_object) else {
        return Err(invalid("Invalid storage item supplied"));
    };

    // Milliseconds since the unix epoch, negative or fractional values are rejected.
    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("Invalid timestamp supplied"))?;

    let publisher = fields
        .get("publisher")
        .and_then(parse_id)
        .ok_or_else(|| invalid("Invalid publisher identity supplied"))?;

    let key = key
        .and_then(parse_id)
        .ok_or_else(|| invalid("Invalid item key supplied"))?;

    let value = fields
        .get("value")
        .ok_or_else(|| invalid("Invalid item value supplied"))?;

    // Timestamps only move forward, an older copy never rolls one back.
    let timestamp = match ctx.storage.get(&key)? {
        Some(existing) => existing.timestamp.max(timestamp),
        None => timestamp,
    };

    ctx.storage.put(
        key,
        StorageItem {
            value: value.clone(),
            publisher,
            timestamp,
        },
    )?;

    response.send(json!([key, item]));

    Ok(())
}

/// `[key]`: replies with up to `k` contacts closest to `key`.
pub fn find_node(k: usize) -> impl Middleware {
    move |ctx: &mut Context<'_>, request: &Request, response: &mut Response| -> Result<(), RpcError> {
        let key = lookup_key(request)?;

        response.send(json!(ctx.routing_table.closest_contacts_to_key(&key, k)));

        Ok(())
    }
}

/// `[key]`: replies with the item stored under `key`, or like [find_node] if there is none.
pub fn find_value(k: usize) -> impl Middleware {
    move |ctx: &mut Context<'_>, request: &Request, response: &mut Response| -> Result<(), RpcError> {
        let key = lookup_key(request)?;

        match ctx.storage.get(&key) {
            Ok(Some(item)) => response.send(json!(item)),
            _ => response.send(json!(ctx.routing_table.closest_contacts_to_key(&key, k))),
        }

        Ok(())
    }
}

fn lookup_key(request: &Request) -> Result<Id, RpcError> {
    request
        .params
        .get(0)
        .and_then(parse_id)
        .ok_or_else(|| invalid("Invalid lookup key supplied"))
}

fn parse_id(value: &Value) -> Option<Id> {
    value.as_str().and_then(|s| Id::from_str(s).ok())
}

fn invalid(message: &str) -> RpcError {
    RpcError::InvalidParams(message.to_string())
}
