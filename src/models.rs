//! Rows persisted by the resolver and the ledger.

use serde::{Deserialize, Serialize};

/// A logical group name mapped to a remote knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameRelation {
    pub id: i64,
    pub name: String,
    pub knowledge_id: String,
    pub created_at: i64,
}

/// One successful upload of a file into a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub id: i64,
    pub knowledge_id: String,
    pub knowledge_name: String,
    /// Key of the uploaded source file (its absolute path).
    pub file_name: String,
    pub created_at: i64,
}

/// Body accepted by `POST /records`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUploadRecord {
    pub knowledge_id: String,
    pub knowledge_name: String,
    pub file_name: String,
}

/// Body accepted by `POST /relations`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNameRelation {
    pub name: String,
    pub knowledge_id: String,
}
