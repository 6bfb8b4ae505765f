use crate::domain::model::{RecipientIdentifier, TemplateDirectory, TemplateMessage};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Provider-side rejection carried in a send response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub code: i64,
    pub subcode: Option<i64>,
    pub http_status: Option<u16>,
    pub message: String,
}

/// A send call that reached the provider and got an answer back.
///
/// Every API representation collapses into this at the adapter boundary;
/// connection failures and timeouts are `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Accepted { message_id: String },
    Rejected(ProviderError),
}

/// The remote messaging API, bound to one account's credentials.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Approved templates only. Fails with `AuthError` when the credential is rejected.
    async fn list_approved_templates(&self) -> Result<TemplateDirectory>;

    /// Uploads header media and returns the provider's media id.
    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String>;

    async fn send_template_message(
        &self,
        recipient: &RecipientIdentifier,
        message: &TemplateMessage,
    ) -> Result<SendResult>;
}
