// Diesel table definitions, kept in sync with the bootstrap DDL in
// repository::migrations.

diesel::table! {
    jobs (id) {
        id -> Text,
        status -> Text,
        ocr_provider -> Text,
        phi_provider -> Text,
        masking_level -> Text,
        input_key -> Text,
        output_key -> Nullable<Text>,
        pages_processed -> Nullable<Integer>,
        phi_entities_masked -> Nullable<Integer>,
        processing_time_ms -> Nullable<BigInt>,
        error_message -> Nullable<Text>,
        retry_count -> Integer,
        next_attempt_at -> Nullable<Text>,
        created_at -> Text,
        started_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
    }
}

diesel::table! {
    phi_entities (id) {
        id -> Integer,
        job_id -> Text,
        text -> Text,
        category -> Text,
        subcategory -> Nullable<Text>,
        page -> Integer,
        confidence -> Double,
        offset -> BigInt,
        length -> BigInt,
        bbox_x -> Double,
        bbox_y -> Double,
        bbox_width -> Double,
        bbox_height -> Double,
    }
}

diesel::joinable!(phi_entities -> jobs (job_id));

diesel::allow_tables_to_appear_in_same_query!(jobs, phi_entities);
