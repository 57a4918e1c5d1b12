use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use cg_core::rotation::model::{EncryptedField, EncryptedModel};

// ============================================================
// Models with encrypted columns
//
// Encrypted columns are nullable and named `encrypted_*`; they hold
// `ENC:` + base64(IV || ciphertext), or legacy plaintext.
// ============================================================

/// rclone remote definition of a transfer job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TransferConfig {
    pub id: i64,
    pub name: String,
    pub source_type: String,
    pub destination_type: String,
    pub encrypted_source_password: Option<String>,
    pub encrypted_source_client_secret: Option<String>,
    pub encrypted_source_token: Option<String>,
    pub encrypted_dest_password: Option<String>,
    pub encrypted_dest_client_secret: Option<String>,
    pub encrypted_dest_token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outbound notification channel (webhook, Pushover, Gotify, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct NotificationService {
    pub id: i64,
    pub name: String,
    pub service_type: String,
    pub encrypted_webhook_secret: Option<String>,
    pub encrypted_api_key: Option<String>,
    pub encrypted_api_token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// External OAuth/OIDC identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuthProvider {
    pub id: i64,
    pub name: String,
    pub provider_type: String,
    pub client_id: Option<String>,
    pub encrypted_client_secret: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Descriptor for a nullable column; `NULL` reads as an empty string.
macro_rules! encrypted_column {
    ($model:ty, $field:ident) => {
        EncryptedField::<$model>::nullable(
            stringify!($field),
            |m| m.$field.as_deref().unwrap_or(""),
            |m, v| m.$field = Some(v),
            |m| m.$field.as_deref(),
        )
    };
}

impl EncryptedModel for TransferConfig {
    fn table_name() -> &'static str {
        "transfer_configs"
    }

    fn encrypted_fields() -> Vec<EncryptedField<Self>> {
        vec![
            encrypted_column!(TransferConfig, encrypted_source_password),
            encrypted_column!(TransferConfig, encrypted_source_client_secret),
            encrypted_column!(TransferConfig, encrypted_source_token),
            encrypted_column!(TransferConfig, encrypted_dest_password),
            encrypted_column!(TransferConfig, encrypted_dest_client_secret),
            encrypted_column!(TransferConfig, encrypted_dest_token),
        ]
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl EncryptedModel for NotificationService {
    fn table_name() -> &'static str {
        "notification_services"
    }

    fn encrypted_fields() -> Vec<EncryptedField<Self>> {
        vec![
            encrypted_column!(NotificationService, encrypted_webhook_secret),
            encrypted_column!(NotificationService, encrypted_api_key),
            encrypted_column!(NotificationService, encrypted_api_token),
        ]
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

impl EncryptedModel for AuthProvider {
    fn table_name() -> &'static str {
        "auth_providers"
    }

    fn encrypted_fields() -> Vec<EncryptedField<Self>> {
        vec![encrypted_column!(AuthProvider, encrypted_client_secret)]
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Tables of every model rotation knows about, in rotation order.
pub fn rotatable_tables() -> Vec<&'static str> {
    vec![
        TransferConfig::table_name(),
        NotificationService::table_name(),
        AuthProvider::table_name(),
    ]
}
