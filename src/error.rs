#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("a consent version must cover at least one consent type")]
    EmptyTypeSet,
    #[error("unrepairable consent drift, removal requires operator confirmation: {}", slugs.join(", "))]
    DriftUnrepairable { slugs: Vec<String> },
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("audit write failure: {0}")]
    AuditWrite(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("internal error: {0}")]
    Internal(String),
}
