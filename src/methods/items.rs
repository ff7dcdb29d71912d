//! Community-issued items.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::handlers::{MethodContext, MethodHandler, MethodRegistry};
use crate::db::schemas::{permissions, Item, Member, UserRef};
use crate::types::{AgoraError, Result};
use crate::util::{now, time_key};

pub(super) fn register(registry: &mut MethodRegistry) {
    registry.register(Arc::new(CreateItem));
    registry.register(Arc::new(TransferItem));
}

fn item_lock(ctx: &MethodContext, key: &str) -> String {
    format!("{}:{key}", ctx.lock_name("items"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateItemArgs {
    class_id: String,
    qty: u64,
    #[serde(default)]
    owner: Option<UserRef>,
}

struct CreateItem;

#[async_trait]
impl MethodHandler for CreateItem {
    fn name(&self) -> &'static str {
        "create-item"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: CreateItemArgs = serde_json::from_value(args)?;
        ctx.require_permission(permissions::MANAGE_ITEMS).await?;

        let key = time_key();
        let _item = ctx.locks.lock(&item_lock(ctx, &key)).await;
        let item = Item {
            owner: args.owner.unwrap_or_else(|| ctx.caller.clone()),
            class_id: args.class_id,
            qty: args.qty,
            created_at: now(),
            last_transfer: None,
        };
        ctx.database.table::<Item>().put(&key, &item).await?;
        info!(
            community = %ctx.database.url(),
            key = %key,
            class_id = %item.class_id,
            qty = item.qty,
            "Item created"
        );
        Ok(json!({ "key": key, "url": ctx.database.record_url("items", &key), "item": item }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferItemArgs {
    item_key: String,
    #[serde(default)]
    qty: Option<u64>,
    recipient: UserRef,
}

struct TransferItem;

#[async_trait]
impl MethodHandler for TransferItem {
    fn name(&self) -> &'static str {
        "transfer-item"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: TransferItemArgs = serde_json::from_value(args)?;
        if args.recipient.user_id == ctx.caller.user_id {
            return Err(AgoraError::Validation("Cannot transfer to yourself".to_string()));
        }
        if ctx
            .database
            .table::<Member>()
            .get(&args.recipient.user_id)
            .await?
            .is_none()
        {
            return Err(AgoraError::Validation(format!(
                "{} is not a member",
                args.recipient.user_id
            )));
        }

        let _item = ctx.locks.lock(&item_lock(ctx, &args.item_key)).await;
        let items = ctx.database.table::<Item>();
        let mut item = items
            .get(&args.item_key)
            .await?
            .ok_or_else(|| AgoraError::NotFound(format!("Item {}", args.item_key)))?;
        // A re-dispatched call finds its own mark and only completes the split
        if item.last_transfer.as_deref() == Some(ctx.call_url.as_str()) {
            return finish_replayed_transfer(ctx, &args, &item).await;
        }
        if item.owner.user_id != ctx.caller.user_id {
            return Err(AgoraError::Permissions(format!(
                "{} does not own item {}",
                ctx.caller.user_id, args.item_key
            )));
        }

        let qty = args.qty.unwrap_or(item.qty);
        if qty == 0 || qty > item.qty {
            return Err(AgoraError::Validation(format!(
                "Cannot transfer {qty} of {}",
                item.qty
            )));
        }

        item.last_transfer = Some(ctx.call_url.clone());
        let transferred_key = if qty == item.qty {
            item.owner = args.recipient.clone();
            items.put(&args.item_key, &item).await?;
            args.item_key.clone()
        } else {
            item.qty -= qty;
            items.put(&args.item_key, &item).await?;
            put_split(ctx, &args.recipient, &item.class_id, qty).await?
        };

        info!(
            community = %ctx.database.url(),
            from = %ctx.caller.user_id,
            to = %args.recipient.user_id,
            qty,
            "Item transferred"
        );
        Ok(json!({ "key": transferred_key, "qty": qty }))
    }
}

/// Write the part of a partial transfer that goes to `recipient`. The key
/// comes from the call, so a repeated write lands on the same record.
async fn put_split(ctx: &MethodContext, recipient: &UserRef, class_id: &str, qty: u64) -> Result<String> {
    let items = ctx.database.table::<Item>();
    let split_key = Item::split_key_for(&ctx.call_url);
    if items.get(&split_key).await?.is_none() {
        let split = Item {
            owner: recipient.clone(),
            class_id: class_id.to_string(),
            qty,
            created_at: now(),
            last_transfer: Some(ctx.call_url.clone()),
        };
        items.put(&split_key, &split).await?;
    }
    Ok(split_key)
}

async fn finish_replayed_transfer(ctx: &MethodContext, args: &TransferItemArgs, item: &Item) -> Result<Value> {
    let (key, qty) = match args.qty {
        Some(qty) if item.owner.user_id == ctx.caller.user_id => {
            (put_split(ctx, &args.recipient, &item.class_id, qty).await?, qty)
        }
        _ => (args.item_key.clone(), item.qty),
    };
    info!(call = %ctx.call_url, key = %key, "Transfer already applied");
    Ok(json!({ "key": key, "qty": qty }))
}
