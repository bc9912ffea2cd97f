use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{line_total, OrderStatus};
use tracing::info;

use crate::auth::CurrentUser;
use crate::catalog::{load_summaries, lock_product};
use crate::error::{AppError, AppResult};
use crate::identity::{ensure_active, load_profiles};
use crate::models::{NewOrder, Order, OrderChanges, OrderView};
use crate::requests::{OrderDraft, OrderPatch};
use crate::schema::{orders, products};
use crate::DbPool;

/// Which counterpart profiles to attach to a batch of orders.
#[derive(Debug, Clone, Copy)]
struct Parties {
    buyer: bool,
    farmer: bool,
}

/// The relationship of an actor to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    Buyer,
    Farmer,
    Admin,
}

impl OrderRole {
    pub fn of(actor: &CurrentUser, order: &Order) -> Option<Self> {
        if actor.is_admin() {
            Some(OrderRole::Admin)
        } else if actor.id == order.farmer_id {
            Some(OrderRole::Farmer)
        } else if actor.id == order.buyer_id {
            Some(OrderRole::Buyer)
        } else {
            None
        }
    }

    /// Sellers and admins drive fulfilment; buyers can only back out.
    pub fn may_set(self, next: OrderStatus) -> bool {
        match self {
            OrderRole::Farmer | OrderRole::Admin => true,
            OrderRole::Buyer => next == OrderStatus::Cancelled,
        }
    }
}

/// Checks a requested status change against the lifecycle table and the
/// actor's role on the order.
pub fn check_transition(role: OrderRole, from: OrderStatus, to: OrderStatus) -> AppResult<()> {
    if !role.may_set(to) {
        return Err(AppError::Forbidden("buyers may only cancel their orders"));
    }
    if !from.can_transition_to(to) {
        return Err(AppError::invalid_transition(from, to));
    }
    Ok(())
}

pub struct OrderEngine {
    pool: DbPool,
}

impl OrderEngine {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn place(&self, buyer: &CurrentUser, draft: OrderDraft) -> AppResult<OrderView> {
        let mut conn = self.pool.get().await?;
        let order = place_order(&mut conn, buyer.id, draft).await?;
        let mut views = hydrate(&mut conn, vec![order], Parties { buyer: false, farmer: true }).await?;
        views.pop().ok_or(AppError::NotFound("order"))
    }

    pub async fn get(&self, order_id: i32, actor: &CurrentUser) -> AppResult<OrderView> {
        let mut conn = self.pool.get().await?;
        let order = orders::table
            .find(order_id)
            .select(Order::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::NotFound("order"))?;
        if OrderRole::of(actor, &order).is_none() {
            return Err(AppError::Forbidden("not a party to this order"));
        }
        let mut views = hydrate(&mut conn, vec![order], Parties { buyer: true, farmer: true }).await?;
        views.pop().ok_or(AppError::NotFound("order"))
    }

    pub async fn update_status(
        &self,
        order_id: i32,
        actor: &CurrentUser,
        patch: OrderPatch,
    ) -> AppResult<OrderView> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let actor = actor.clone();
        let (order, previous) = conn
            .transaction::<_, AppError, _>(|conn| {
                Box::pin(async move {
                    ensure_active(conn, actor.id).await?;
                    let order = orders::table
                        .find(order_id)
                        .select(Order::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?
                        .ok_or(AppError::NotFound("order"))?;
                    let role = OrderRole::of(&actor, &order)
                        .ok_or(AppError::Forbidden("not a party to this order"))?;

                    if patch.touches_details() {
                        if role == OrderRole::Farmer {
                            return Err(AppError::Forbidden(
                                "only the buyer may edit delivery details",
                            ));
                        }
                        if order.status != OrderStatus::Pending {
                            return Err(AppError::Conflict(
                                "delivery details can only change while the order is pending",
                            ));
                        }
                    }
                    if let Some(next) = patch.status {
                        check_transition(role, order.status, next)?;
                        if next == OrderStatus::Cancelled {
                            restock(conn, order.product_id, order.quantity).await?;
                        }
                    }

                    let changes = OrderChanges {
                        status: patch.status,
                        delivery_address: patch.delivery_address,
                        notes: patch.notes,
                        updated_at: Some(Utc::now()),
                    };
                    let updated = diesel::update(orders::table.find(order_id))
                        .set(&changes)
                        .returning(Order::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok((updated, order.status))
                })
            })
            .await?;

        if order.status != previous {
            info!("Order {} moved from {} to {}", order.id, previous, order.status);
        }
        let mut views = hydrate(conn, vec![order], Parties { buyer: true, farmer: true }).await?;
        views.pop().ok_or(AppError::NotFound("order"))
    }

    /// A buyer's purchases with the seller's profile attached.
    pub async fn list_by_buyer(&self, buyer_id: i32, actor: &CurrentUser) -> AppResult<Vec<OrderView>> {
        actor.require_self_or_admin(buyer_id)?;
        let mut conn = self.pool.get().await?;
        let found = orders::table
            .filter(orders::buyer_id.eq(buyer_id))
            .order((orders::created_at.desc(), orders::id.desc()))
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        hydrate(&mut conn, found, Parties { buyer: false, farmer: true }).await
    }

    /// A farmer's incoming orders with the buyer's profile attached.
    pub async fn list_by_farmer(&self, farmer_id: i32, actor: &CurrentUser) -> AppResult<Vec<OrderView>> {
        actor.require_self_or_admin(farmer_id)?;
        let mut conn = self.pool.get().await?;
        let found = orders::table
            .filter(orders::farmer_id.eq(farmer_id))
            .order((orders::created_at.desc(), orders::id.desc()))
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        hydrate(&mut conn, found, Parties { buyer: true, farmer: false }).await
    }
}

/// Places an order in one transaction: the product row is locked, stock is
/// checked and decremented, and the order is inserted with its total fixed
/// at the current price.
pub(crate) async fn place_order(
    conn: &mut AsyncPgConnection,
    buyer_id: i32,
    draft: OrderDraft,
) -> AppResult<Order> {
    let order = conn
        .transaction::<_, AppError, _>(|conn| {
            Box::pin(async move {
                ensure_active(conn, buyer_id).await?;
                let product = lock_product(conn, draft.product_id).await?;
                if !product.is_publicly_visible() {
                    return Err(AppError::NotFound("product"));
                }
                if product.farmer_id == buyer_id {
                    return Err(AppError::Forbidden("cannot order your own product"));
                }
                let shortfall = AppError::InsufficientStock {
                    available: product.available_quantity,
                    requested: draft.quantity,
                };
                if draft.quantity > product.available_quantity {
                    return Err(shortfall);
                }

                let decremented = diesel::update(
                    products::table
                        .find(product.id)
                        .filter(products::available_quantity.ge(draft.quantity)),
                )
                .set((
                    products::available_quantity.eq(products::available_quantity - draft.quantity),
                    products::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
                if decremented == 0 {
                    return Err(shortfall);
                }

                let new_order = NewOrder {
                    buyer_id,
                    product_id: product.id,
                    farmer_id: product.farmer_id,
                    quantity: draft.quantity,
                    total_price: line_total(&product.price, draft.quantity),
                    status: OrderStatus::Pending,
                    delivery_address: draft.delivery_address,
                    notes: draft.notes,
                };
                let order = diesel::insert_into(orders::table)
                    .values(&new_order)
                    .returning(Order::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(order)
            })
        })
        .await?;

    info!(
        "Order {} placed by buyer {} for {} x product {} (total {})",
        order.id, buyer_id, order.quantity, order.product_id, order.total_price
    );
    Ok(order)
}

/// Returns cancelled units to the listing, never above its listed quantity.
async fn restock(conn: &mut AsyncPgConnection, product_id: i32, quantity: i32) -> AppResult<()> {
    let product = lock_product(conn, product_id).await?;
    let available = product
        .available_quantity
        .saturating_add(quantity)
        .min(product.quantity);
    diesel::update(products::table.find(product_id))
        .set((
            products::available_quantity.eq(available),
            products::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

async fn hydrate(
    conn: &mut AsyncPgConnection,
    found: Vec<Order>,
    parties: Parties,
) -> AppResult<Vec<OrderView>> {
    let product_ids = found.iter().map(|o| o.product_id).collect();
    let mut user_ids = Vec::new();
    for order in &found {
        if parties.buyer {
            user_ids.push(order.buyer_id);
        }
        if parties.farmer {
            user_ids.push(order.farmer_id);
        }
    }
    let summaries = load_summaries(conn, product_ids).await?;
    let profiles = load_profiles(conn, user_ids).await?;

    Ok(found
        .into_iter()
        .map(|order| OrderView {
            product: summaries.get(&order.product_id).cloned(),
            buyer: parties
                .buyer
                .then(|| profiles.get(&order.buyer_id).cloned())
                .flatten(),
            farmer: parties
                .farmer
                .then(|| profiles.get(&order.farmer_id).cloned())
                .flatten(),
            order,
        })
        .collect())
}
