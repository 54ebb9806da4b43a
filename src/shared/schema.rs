diesel::table! {
    consent_versions (id) {
        id -> Uuid,
        version_label -> Varchar,
        type_slugs -> Array<Text>,
        type_definitions -> Jsonb,
        is_active -> Bool,
        effective_date -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    user_consents (id) {
        id -> Uuid,
        user_id -> Uuid,
        type_slug -> Varchar,
        version_id -> Nullable<Uuid>,
        granted -> Bool,
        legal_basis -> Varchar,
        granted_at -> Timestamptz,
        withdrawn_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    audit_log (sequence) {
        sequence -> Int8,
        actor -> Varchar,
        action -> Varchar,
        context -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(user_consents -> consent_versions (version_id));

diesel::allow_tables_to_appear_in_same_query!(
    audit_log,
    consent_versions,
    user_consents,
);
