//! Admin review of listings before they reach the public catalog.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{FarmerSummary, Product, ProductView};
use crate::schema::{products, users};
use crate::DbPool;

pub struct Moderation {
    pool: DbPool,
}

impl Moderation {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Listings waiting for a decision, oldest first. Rejected listings stay
    /// out of the queue until their owner edits them.
    pub async fn pending_queue(&self) -> AppResult<Vec<ProductView<FarmerSummary>>> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<(Product, FarmerSummary)> = products::table
            .inner_join(users::table)
            .filter(products::is_approved.eq(false))
            .filter(products::rejection_reason.is_null())
            .order((products::created_at.asc(), products::id.asc()))
            .select((Product::as_select(), FarmerSummary::as_select()))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(product, farmer)| ProductView::new(product, Some(farmer)))
            .collect())
    }

    /// Approving an already approved listing succeeds and changes nothing
    /// but `updated_at`.
    pub async fn approve(&self, product_id: i32) -> AppResult<ProductView<FarmerSummary>> {
        let mut conn = self.pool.get().await?;
        let product = diesel::update(products::table.find(product_id))
            .set((
                products::is_approved.eq(true),
                products::rejection_reason.eq(None::<String>),
                products::updated_at.eq(Utc::now()),
            ))
            .returning(Product::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::NotFound("product"))?;

        info!("Product {} approved", product.id);
        Ok(ProductView::new(product, None))
    }

    /// Withdraws a listing from public view and records why.
    pub async fn reject(&self, product_id: i32, reason: String) -> AppResult<ProductView<FarmerSummary>> {
        let mut conn = self.pool.get().await?;
        let product = diesel::update(products::table.find(product_id))
            .set((
                products::is_approved.eq(false),
                products::rejection_reason.eq(Some(reason)),
                products::updated_at.eq(Utc::now()),
            ))
            .returning(Product::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::NotFound("product"))?;

        info!("Product {} rejected", product.id);
        Ok(ProductView::new(product, None))
    }
}
