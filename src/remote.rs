use serde::{Deserialize, Serialize};

/// Request sent to the account-provisioning dependency.
///
/// `operation_id` doubles as the downstream dedupe key: the remote side is
/// documented to be safe to invoke more than once for the same id, which is
/// what lets the retry executor re-invoke the call and the compensation
/// consumer complete it out of band without duplicating the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub operation_id: String,
    pub name: String,
    pub email: String,
}

/// Response from the account-provisioning dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub account_id: String,
    pub status: AccountStatus,
}

/// Provisioning state as reported by the dependency. `Pending` is also the
/// status a caller should surface when the effect was handed to the
/// compensation channel instead of completing synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Pending,
}
