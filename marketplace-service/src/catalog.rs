use chrono::Utc;
use diesel::expression_methods::PgTextExpressionMethods;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{ProductFilters, Role};
use std::collections::HashMap;
use tracing::info;

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::identity::ensure_active;
use crate::models::{
    FarmerSummary, NewProduct, Product, ProductChanges, ProductSummary, ProductView, PublicProfile,
};
use crate::requests::{ProductDraft, ProductPatch};
use crate::schema::{orders, products, users};
use crate::DbPool;

/// Escapes LIKE metacharacters so user input matches literally.
pub fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Resolves the stock pair after an edit. Without an explicit
/// `available_quantity`, remaining stock is clamped to the new listed quantity.
pub fn resolve_stock(
    current_quantity: i32,
    current_available: i32,
    quantity: Option<i32>,
    available: Option<i32>,
) -> AppResult<(i32, i32)> {
    let quantity = quantity.unwrap_or(current_quantity);
    let available = available.unwrap_or_else(|| current_available.min(quantity));
    if available < 0 || available > quantity {
        return Err(AppError::validation(
            "availableQuantity",
            "must be between 0 and quantity",
        ));
    }
    Ok((quantity, available))
}

pub struct Catalog {
    pool: DbPool,
}

impl Catalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, actor: &CurrentUser, draft: ProductDraft) -> AppResult<ProductView<FarmerSummary>> {
        actor.require_any(&[Role::Farmer, Role::Admin])?;
        let mut conn = self.pool.get().await?;
        let product = create_product(&mut conn, actor.id, draft).await?;
        Ok(ProductView::new(product, None))
    }

    pub async fn list(&self, filters: ProductFilters) -> AppResult<Vec<ProductView<FarmerSummary>>> {
        let mut query = products::table
            .inner_join(users::table)
            .select((Product::as_select(), FarmerSummary::as_select()))
            .into_boxed();

        if let Some(category) = filters.category {
            query = query.filter(products::category.eq(category));
        }
        if let Some(commune) = filters.commune {
            query = query.filter(products::commune.eq(commune));
        }
        if let Some(province) = filters.province {
            query = query.filter(products::province.eq(province));
        }
        if let Some(search) = filters.search {
            query = query.filter(products::name.ilike(format!("%{}%", escape_like(&search))));
        }
        if let Some(approved) = filters.approved {
            query = query.filter(products::is_approved.eq(approved));
        }
        if filters.active_only {
            query = query.filter(products::is_active.eq(true));
        }

        let mut conn = self.pool.get().await?;
        let rows: Vec<(Product, FarmerSummary)> = query
            .order((products::created_at.desc(), products::id.desc()))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(product, farmer)| ProductView::new(product, Some(farmer)))
            .collect())
    }

    /// Hidden listings are reported as missing to everyone but their owner
    /// and admins.
    pub async fn get(&self, product_id: i32, viewer: Option<&CurrentUser>) -> AppResult<ProductView<PublicProfile>> {
        let mut conn = self.pool.get().await?;
        let (product, farmer): (Product, PublicProfile) = products::table
            .inner_join(users::table)
            .filter(products::id.eq(product_id))
            .select((Product::as_select(), PublicProfile::as_select()))
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::NotFound("product"))?;

        let privileged = viewer.is_some_and(|v| v.is_admin() || v.id == product.farmer_id);
        if !product.is_publicly_visible() && !privileged {
            return Err(AppError::NotFound("product"));
        }
        Ok(ProductView::new(product, Some(farmer)))
    }

    pub async fn list_by_farmer(
        &self,
        farmer_id: i32,
        viewer: &CurrentUser,
    ) -> AppResult<Vec<ProductView<FarmerSummary>>> {
        let mut query = products::table
            .filter(products::farmer_id.eq(farmer_id))
            .select(Product::as_select())
            .into_boxed();
        if viewer.id != farmer_id && !viewer.is_admin() {
            query = query
                .filter(products::is_active.eq(true))
                .filter(products::is_approved.eq(true));
        }

        let mut conn = self.pool.get().await?;
        let listings = query
            .order((products::created_at.desc(), products::id.desc()))
            .load(&mut conn)
            .await?;
        Ok(listings
            .into_iter()
            .map(|product| ProductView::new(product, None))
            .collect())
    }

    pub async fn update(
        &self,
        product_id: i32,
        actor: &CurrentUser,
        patch: ProductPatch,
    ) -> AppResult<ProductView<FarmerSummary>> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let actor_id = actor.id;
        let actor = actor.clone();
        let product = conn
            .transaction::<_, AppError, _>(|conn| {
                Box::pin(async move {
                    ensure_active(conn, actor.id).await?;
                    let current = lock_product(conn, product_id).await?;
                    actor.require_self_or_admin(current.farmer_id)?;

                    let stock_touched = patch.quantity.is_some() || patch.available_quantity.is_some();
                    // A content edit answers a rejection and puts the listing back in the queue.
                    let resubmitted = patch.touches_listing();
                    let (quantity, available) = resolve_stock(
                        current.quantity,
                        current.available_quantity,
                        patch.quantity,
                        patch.available_quantity,
                    )?;
                    let changes = ProductChanges {
                        name: patch.name,
                        description: patch.description,
                        category: patch.category,
                        price: patch.price,
                        unit: patch.unit,
                        quantity: stock_touched.then_some(quantity),
                        available_quantity: stock_touched.then_some(available),
                        harvest_date: patch.harvest_date,
                        commune: patch.commune,
                        location: patch.location,
                        province: patch.province,
                        images: patch.images,
                        is_active: patch.is_active,
                        rejection_reason: resubmitted.then_some(None),
                        updated_at: Some(Utc::now()),
                    };

                    let updated = diesel::update(products::table.find(product_id))
                        .set(&changes)
                        .returning(Product::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok(updated)
                })
            })
            .await?;

        info!("Product {} updated by user {}", product.id, actor_id);
        Ok(ProductView::new(product, None))
    }

    pub async fn delete(&self, product_id: i32, actor: &CurrentUser) -> AppResult<()> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let actor = actor.clone();
        conn.transaction::<_, AppError, _>(|conn| {
            Box::pin(async move {
                ensure_active(conn, actor.id).await?;
                let product = lock_product(conn, product_id).await?;
                actor.require_self_or_admin(product.farmer_id)?;

                let has_orders: bool = diesel::select(diesel::dsl::exists(
                    orders::table.filter(orders::product_id.eq(product_id)),
                ))
                .get_result(conn)
                .await?;
                if has_orders {
                    return Err(AppError::Conflict("product has orders and cannot be deleted"));
                }

                diesel::delete(products::table.find(product_id))
                    .execute(conn)
                    .await
                    .map_err(|e| match e {
                        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                            AppError::Conflict("product has orders and cannot be deleted")
                        }
                        other => AppError::Database(other),
                    })?;
                Ok(())
            })
        })
        .await?;

        info!("Product {} deleted", product_id);
        Ok(())
    }
}

/// Reads a product row under `FOR UPDATE` for the rest of the transaction.
pub(crate) async fn lock_product(conn: &mut AsyncPgConnection, product_id: i32) -> AppResult<Product> {
    products::table
        .find(product_id)
        .select(Product::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(AppError::NotFound("product"))
}

/// Loads product cards for a set of ids, keyed by id.
pub(crate) async fn load_summaries(
    conn: &mut AsyncPgConnection,
    ids: Vec<i32>,
) -> AppResult<HashMap<i32, ProductSummary>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let summaries = products::table
        .filter(products::id.eq_any(ids))
        .select(ProductSummary::as_select())
        .load(conn)
        .await?;
    Ok(summaries.into_iter().map(|s| (s.id, s)).collect())
}

/// Stores a validated listing for `farmer_id`. New listings always start
/// unapproved with their full quantity available.
pub(crate) async fn create_product(
    conn: &mut AsyncPgConnection,
    farmer_id: i32,
    draft: ProductDraft,
) -> AppResult<Product> {
    ensure_active(conn, farmer_id).await?;
    let new_product = NewProduct {
        farmer_id,
        name: draft.name,
        description: draft.description,
        category: draft.category,
        price: draft.price,
        unit: draft.unit,
        quantity: draft.quantity,
        available_quantity: draft.quantity,
        harvest_date: draft.harvest_date,
        commune: draft.commune,
        location: draft.location,
        province: draft.province,
        images: draft.images,
        is_active: draft.is_active,
    };
    let product = diesel::insert_into(products::table)
        .values(&new_product)
        .returning(Product::as_returning())
        .get_result(conn)
        .await?;
    info!(
        "Product {} ({}) created by farmer {}, awaiting approval",
        product.id, product.name, farmer_id
    );
    Ok(product)
}
