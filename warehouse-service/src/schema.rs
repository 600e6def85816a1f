diesel::table! {
    capacity_movements (id) {
        id -> Int8,
        warehouse_id -> Int4,
        order_id -> Int8,
        kind -> Varchar,
        requested_units -> Int8,
        applied_units -> Int8,
        reserved_after -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    order_cancellations (order_id, piece_id) {
        order_id -> Int8,
        piece_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    pieces (id) {
        id -> Int8,
        order_id -> Nullable<Int8>,
        piece_type -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        producing_started_at -> Nullable<Timestamptz>,
        produced_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    warehouse (id) {
        id -> Int4,
        reserved_units -> Int8,
        max_capacity -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(capacity_movements -> warehouse (warehouse_id));

diesel::allow_tables_to_appear_in_same_query!(
    capacity_movements,
    order_cancellations,
    pieces,
    warehouse,
);
