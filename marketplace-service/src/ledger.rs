//! Buyer feedback and direct-contact requests. Both records always take the
//! farmer from the referenced product.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{ContactStatus, OrderStatus};
use tracing::info;

use crate::auth::CurrentUser;
use crate::catalog::load_summaries;
use crate::error::{AppError, AppResult};
use crate::identity::{ensure_active, load_profiles};
use crate::models::{Contact, ContactView, NewContact, NewReview, Product, Review, ReviewView};
use crate::requests::{ContactDraft, ReviewDraft};
use crate::schema::{contacts, orders, products, reviews};
use crate::DbPool;

pub struct Ledger {
    pool: DbPool,
}

impl Ledger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Only buyers with a delivered order for the product may review it.
    pub async fn add_review(&self, buyer: &CurrentUser, draft: ReviewDraft) -> AppResult<ReviewView> {
        let mut conn = self.pool.get().await?;
        ensure_active(&mut conn, buyer.id).await?;
        let product = find_product(&mut conn, draft.product_id).await?;

        let purchased: bool = diesel::select(diesel::dsl::exists(
            orders::table
                .filter(orders::buyer_id.eq(buyer.id))
                .filter(orders::product_id.eq(product.id))
                .filter(orders::status.eq(OrderStatus::Delivered)),
        ))
        .get_result(&mut conn)
        .await?;
        if !purchased {
            return Err(AppError::Forbidden(
                "only buyers with a delivered order may review this product",
            ));
        }

        let review = diesel::insert_into(reviews::table)
            .values(&NewReview {
                buyer_id: buyer.id,
                product_id: product.id,
                farmer_id: product.farmer_id,
                rating: draft.rating,
                comment: draft.comment,
            })
            .returning(Review::as_returning())
            .get_result(&mut conn)
            .await?;
        info!("Review {} ({} stars) added to product {}", review.id, review.rating, product.id);

        let mut profiles = load_profiles(&mut conn, vec![buyer.id]).await?;
        Ok(ReviewView {
            buyer: profiles.remove(&buyer.id),
            review,
        })
    }

    pub async fn add_contact(&self, buyer: &CurrentUser, draft: ContactDraft) -> AppResult<ContactView> {
        let mut conn = self.pool.get().await?;
        let contact = add_contact_in(&mut conn, buyer.id, draft).await?;
        let mut views = hydrate_contacts(&mut conn, vec![contact]).await?;
        views.pop().ok_or(AppError::NotFound("contact"))
    }

    pub async fn list_reviews_for_product(&self, product_id: i32) -> AppResult<Vec<ReviewView>> {
        let mut conn = self.pool.get().await?;
        let found = reviews::table
            .filter(reviews::product_id.eq(product_id))
            .order((reviews::created_at.desc(), reviews::id.desc()))
            .select(Review::as_select())
            .load(&mut conn)
            .await?;
        let buyer_ids = found.iter().map(|r| r.buyer_id).collect();
        let profiles = load_profiles(&mut conn, buyer_ids).await?;

        Ok(found
            .into_iter()
            .map(|review| ReviewView {
                buyer: profiles.get(&review.buyer_id).cloned(),
                review,
            })
            .collect())
    }

    pub async fn list_contacts_for_farmer(
        &self,
        farmer_id: i32,
        actor: &CurrentUser,
    ) -> AppResult<Vec<ContactView>> {
        actor.require_self_or_admin(farmer_id)?;
        let mut conn = self.pool.get().await?;
        let found = contacts::table
            .filter(contacts::farmer_id.eq(farmer_id))
            .order((contacts::created_at.desc(), contacts::id.desc()))
            .select(Contact::as_select())
            .load(&mut conn)
            .await?;
        hydrate_contacts(&mut conn, found).await
    }

    pub async fn update_contact_status(
        &self,
        contact_id: i32,
        actor: &CurrentUser,
        next: ContactStatus,
    ) -> AppResult<ContactView> {
        let mut pooled = self.pool.get().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let actor = actor.clone();
        let contact = conn
            .transaction::<_, AppError, _>(|conn| {
                Box::pin(async move {
                    ensure_active(conn, actor.id).await?;
                    let contact = contacts::table
                        .find(contact_id)
                        .select(Contact::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?
                        .ok_or(AppError::NotFound("contact"))?;
                    if contact.farmer_id != actor.id && !actor.is_admin() {
                        return Err(AppError::Forbidden("only the farmer may update this contact"));
                    }
                    if !contact.status.can_transition_to(next) {
                        return Err(AppError::invalid_transition(contact.status, next));
                    }

                    let updated = diesel::update(contacts::table.find(contact_id))
                        .set((
                            contacts::status.eq(next),
                            contacts::updated_at.eq(Utc::now()),
                        ))
                        .returning(Contact::as_returning())
                        .get_result(conn)
                        .await?;
                    Ok(updated)
                })
            })
            .await?;

        info!("Contact {} marked {}", contact.id, contact.status);
        let mut views = hydrate_contacts(conn, vec![contact]).await?;
        views.pop().ok_or(AppError::NotFound("contact"))
    }
}

async fn find_product(conn: &mut AsyncPgConnection, product_id: i32) -> AppResult<Product> {
    products::table
        .find(product_id)
        .select(Product::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(AppError::NotFound("product"))
}

/// Records a contact request against a publicly visible listing.
pub(crate) async fn add_contact_in(
    conn: &mut AsyncPgConnection,
    buyer_id: i32,
    draft: ContactDraft,
) -> AppResult<Contact> {
    ensure_active(conn, buyer_id).await?;
    let product = find_product(conn, draft.product_id).await?;
    if !product.is_publicly_visible() {
        return Err(AppError::NotFound("product"));
    }
    if product.farmer_id == buyer_id {
        return Err(AppError::Forbidden("cannot contact yourself about your own product"));
    }

    let contact = diesel::insert_into(contacts::table)
        .values(&NewContact {
            buyer_id,
            product_id: product.id,
            farmer_id: product.farmer_id,
            message: draft.message,
            buyer_phone: draft.buyer_phone,
            status: ContactStatus::Pending,
        })
        .returning(Contact::as_returning())
        .get_result(conn)
        .await?;
    info!(
        "Contact {} from buyer {} to farmer {} about product {}",
        contact.id, buyer_id, contact.farmer_id, product.id
    );
    Ok(contact)
}

async fn hydrate_contacts(conn: &mut AsyncPgConnection, found: Vec<Contact>) -> AppResult<Vec<ContactView>> {
    let buyer_ids = found.iter().map(|c| c.buyer_id).collect();
    let product_ids = found.iter().map(|c| c.product_id).collect();
    let profiles = load_profiles(conn, buyer_ids).await?;
    let summaries = load_summaries(conn, product_ids).await?;

    Ok(found
        .into_iter()
        .map(|contact| ContactView {
            buyer: profiles.get(&contact.buyer_id).cloned(),
            product: summaries.get(&contact.product_id).cloned(),
            contact,
        })
        .collect())
}
