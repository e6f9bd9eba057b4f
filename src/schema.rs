// Kept in sync by hand with `db::Database::init_schema`.

diesel::table! {
    conversation (id) {
        id -> Text,
        name -> Text,
        chat_type -> Text,
        create_time -> Timestamp,
    }
}

diesel::table! {
    message (id) {
        id -> Text,
        conversation_id -> Text,
        chat_type -> Text,
        query -> Text,
        response -> Text,
        meta_data -> Text,
        feedback_score -> Integer,
        feedback_reason -> Text,
        create_time -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(conversation, message,);
