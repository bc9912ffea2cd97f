//! Replays mutations that clients queued while offline. Every command is
//! keyed by a client-chosen idempotency key, claimed in `processed_commands`
//! in the same transaction that applies it, so a retried flush never applies
//! a command twice.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{Role, SyncCommand, SyncKind, SyncReply};
use tracing::{info, warn};

use crate::auth::CurrentUser;
use crate::catalog::create_product;
use crate::error::{AppError, AppResult};
use crate::ledger::add_contact_in;
use crate::models::{FarmerSummary, NewProcessedCommand, ProcessedCommand, ProductView};
use crate::orders::place_order;
use crate::requests::{CreateContactRequest, CreateProductRequest, PlaceOrderRequest};
use crate::schema::processed_commands;
use crate::DbPool;

pub const MAX_BATCH: usize = 50;
pub const MAX_KEY_LEN: usize = 128;

enum Outcome {
    Applied(Value),
    Replayed(Option<Value>),
    KeyReused(String),
}

pub struct SyncProcessor {
    pool: DbPool,
}

impl SyncProcessor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Applies a batch in order. Domain failures reject the single command;
    /// infrastructure failures abort the rest of the batch.
    pub async fn process(&self, actor: &CurrentUser, commands: Vec<SyncCommand>) -> AppResult<Vec<SyncReply>> {
        if commands.len() > MAX_BATCH {
            return Err(AppError::validation(
                "commands",
                format!("at most {} commands per batch", MAX_BATCH),
            ));
        }

        let mut conn = self.pool.get().await?;
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            replies.push(self.process_command(&mut conn, actor, command).await?);
        }

        info!(
            "Processed sync batch of {} command(s) for user {}",
            replies.len(),
            actor.id
        );
        Ok(replies)
    }

    async fn process_command(
        &self,
        conn: &mut AsyncPgConnection,
        actor: &CurrentUser,
        command: SyncCommand,
    ) -> AppResult<SyncReply> {
        let key = command.idempotency_key.trim().to_string();
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(SyncReply::rejected(
                command.idempotency_key,
                format!("idempotency key must be 1 to {} characters", MAX_KEY_LEN),
            ));
        }

        let actor = actor.clone();
        let claim_key = key.clone();
        let outcome = conn
            .transaction::<_, AppError, _>(|conn| {
                Box::pin(async move {
                    let claimed = diesel::insert_into(processed_commands::table)
                        .values(&NewProcessedCommand {
                            user_id: actor.id,
                            idempotency_key: claim_key.clone(),
                            kind: command.kind.as_str().to_string(),
                        })
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;

                    if claimed == 0 {
                        let existing = processed_commands::table
                            .find((actor.id, claim_key))
                            .select(ProcessedCommand::as_select())
                            .first(conn)
                            .await?;
                        if existing.kind != command.kind.as_str() {
                            return Ok(Outcome::KeyReused(existing.kind));
                        }
                        return Ok(Outcome::Replayed(existing.result));
                    }

                    let result = apply(conn, &actor, command.kind, command.payload).await?;
                    diesel::update(processed_commands::table.find((actor.id, claim_key)))
                        .set(processed_commands::result.eq(Some(result.clone())))
                        .execute(conn)
                        .await?;
                    Ok(Outcome::Applied(result))
                })
            })
            .await;

        let reply = match outcome {
            Ok(Outcome::Applied(result)) => SyncReply::applied(key, result),
            Ok(Outcome::Replayed(result)) => SyncReply::replayed(key, result),
            Ok(Outcome::KeyReused(kind)) => {
                SyncReply::rejected(key, format!("idempotency key already used for {}", kind))
            }
            Err(err) if err.is_internal() => return Err(err),
            Err(err) => {
                warn!("Sync command {} rejected: {}", key, err);
                SyncReply::rejected(key, describe(&err))
            }
        };
        Ok(reply)
    }
}

async fn apply(conn: &mut AsyncPgConnection, actor: &CurrentUser, kind: SyncKind, payload: Value) -> AppResult<Value> {
    match kind {
        SyncKind::CreateProduct => {
            actor.require_any(&[Role::Farmer, Role::Admin])?;
            let draft = parse_payload::<CreateProductRequest>(payload)?.validate()?;
            let product = create_product(conn, actor.id, draft).await?;
            to_json(&ProductView::<FarmerSummary>::new(product, None))
        }
        SyncKind::PlaceOrder => {
            let draft = parse_payload::<PlaceOrderRequest>(payload)?.validate()?;
            let order = place_order(conn, actor.id, draft).await?;
            to_json(&order)
        }
        SyncKind::AddContact => {
            let draft = parse_payload::<CreateContactRequest>(payload)?.validate()?;
            let contact = add_contact_in(conn, actor.id, draft).await?;
            to_json(&contact)
        }
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Value) -> AppResult<T> {
    serde_json::from_value(payload).map_err(|e| AppError::validation("payload", e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> AppResult<Value> {
    Ok(serde_json::to_value(value).map_err(anyhow::Error::from)?)
}

/// Error text for a rejected command, including field issues.
fn describe(err: &AppError) -> String {
    match err {
        AppError::Validation(issues) => {
            let detail: Vec<String> = issues
                .iter()
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect();
            format!("{} ({})", err, detail.join("; "))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldIssue;

    #[test]
    fn describes_validation_issues() {
        let err = AppError::Validation(vec![
            FieldIssue::new("quantity", "must be at least 1"),
            FieldIssue::new("notes", "must be at most 2000 characters"),
        ]);
        assert_eq!(
            describe(&err),
            "validation failed (quantity: must be at least 1; notes: must be at most 2000 characters)"
        );
        assert_eq!(describe(&AppError::NotFound("product")), "product not found");
    }

    #[test]
    fn payload_shape_errors_are_validation() {
        let parsed = parse_payload::<PlaceOrderRequest>(serde_json::json!({"productId": "seven"}));
        assert!(matches!(parsed, Err(AppError::Validation(_))));
    }
}
