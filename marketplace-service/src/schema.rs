diesel::table! {
    users (id) {
        id -> Int4,
        username -> Varchar,
        email -> Varchar,
        password_hash -> Text,
        first_name -> Varchar,
        last_name -> Varchar,
        phone -> Nullable<Varchar>,
        role -> Varchar,
        location -> Nullable<Varchar>,
        profile_image -> Nullable<Text>,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    products (id) {
        id -> Int4,
        farmer_id -> Int4,
        name -> Varchar,
        description -> Nullable<Text>,
        category -> Varchar,
        price -> Numeric,
        unit -> Varchar,
        quantity -> Int4,
        available_quantity -> Int4,
        harvest_date -> Date,
        commune -> Varchar,
        location -> Nullable<Varchar>,
        province -> Varchar,
        images -> Array<Text>,
        is_active -> Bool,
        is_approved -> Bool,
        rejection_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int4,
        buyer_id -> Int4,
        product_id -> Int4,
        farmer_id -> Int4,
        quantity -> Int4,
        total_price -> Numeric,
        status -> Varchar,
        delivery_address -> Nullable<Text>,
        notes -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reviews (id) {
        id -> Int4,
        buyer_id -> Int4,
        product_id -> Int4,
        farmer_id -> Int4,
        rating -> Int4,
        comment -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    contacts (id) {
        id -> Int4,
        buyer_id -> Int4,
        product_id -> Int4,
        farmer_id -> Int4,
        message -> Text,
        buyer_phone -> Nullable<Varchar>,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_commands (user_id, idempotency_key) {
        user_id -> Int4,
        idempotency_key -> Varchar,
        kind -> Varchar,
        result -> Nullable<Jsonb>,
        processed_at -> Timestamptz,
    }
}

diesel::joinable!(products -> users (farmer_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    products,
    orders,
    reviews,
    contacts,
    processed_commands,
);
