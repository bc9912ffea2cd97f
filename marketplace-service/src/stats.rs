use diesel::dsl::{count_distinct, count_star};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use shared::{Role, StatsSummary};

use crate::error::AppResult;
use crate::schema::{orders, products, users};
use crate::DbPool;

pub async fn summary(pool: &DbPool) -> AppResult<StatsSummary> {
    let mut conn = pool.get().await?;

    let total_farmers = users::table
        .filter(users::role.eq(Role::Farmer))
        .select(count_star())
        .get_result(&mut conn)
        .await?;
    let total_products = products::table
        .filter(products::is_approved.eq(true))
        .select(count_star())
        .get_result(&mut conn)
        .await?;
    let total_orders = orders::table
        .select(count_star())
        .get_result(&mut conn)
        .await?;
    let total_communes = products::table
        .select(count_distinct(products::commune))
        .get_result(&mut conn)
        .await?;

    Ok(StatsSummary {
        total_farmers,
        total_products,
        total_orders,
        total_communes,
    })
}
