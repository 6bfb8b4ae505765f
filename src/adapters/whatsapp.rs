//! WhatsApp Cloud API (Graph API) implementation of [`MessagingApi`].
//!
//! Every response shape the API produces is reduced here to [`SendResult`] or
//! a [`DispatchError`], so nothing past this module looks at raw JSON.

use crate::domain::model::{
    HeaderKind, MediaKind, RecipientIdentifier, TemplateDirectory, TemplateInfo, TemplateMessage,
};
use crate::domain::ports::{MessagingApi, ProviderError, SendResult};
use crate::utils::error::{DispatchError, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_API_VERSION: &str = "v24.0";

const TEMPLATE_PAGE_SIZE: u32 = 100;
const AUTH_ERROR_CODE: i64 = 190;

/// Header media the Cloud API accepts, by file extension. First entry per MIME type is canonical.
const MEDIA_EXTENSIONS: &[(&str, &str)] = &[
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("png", "image/png"),
    ("mp4", "video/mp4"),
    ("3gp", "video/3gpp"),
    ("3gpp", "video/3gpp"),
    ("pdf", "application/pdf"),
];

/// MIME type for a header media file, judged by its extension.
pub fn mime_type_for_file(path: &str) -> Result<&'static str> {
    let extension = std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    MEDIA_EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .ok_or_else(|| DispatchError::UnsupportedMediaType {
            mime_type: format!("unknown (.{} file)", extension),
        })
}

#[derive(Debug, Clone)]
pub struct WhatsAppCredentials {
    pub access_token: String,
    pub phone_number_id: String,
    pub business_account_id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    error_subcode: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TemplatePage {
    #[serde(default)]
    data: Vec<RawTemplate>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTemplate {
    name: String,
    language: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    components: Vec<RawComponent>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    #[serde(rename = "type")]
    kind: String,
    format: Option<String>,
    text: Option<String>,
    example: Option<RawExample>,
}

#[derive(Debug, Deserialize)]
struct RawExample {
    #[serde(default)]
    body_text: Vec<Vec<String>>,
}

#[derive(Clone)]
pub struct WhatsAppClient {
    client: Client,
    api_root: String,
    credentials: WhatsAppCredentials,
}

impl WhatsAppClient {
    pub fn new(
        base_url: &str,
        api_version: &str,
        credentials: WhatsAppCredentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_root: format!("{}/{}", base_url.trim_end_matches('/'), api_version),
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path)
    }

    /// Request body for a template send.
    pub fn build_send_payload(recipient: &RecipientIdentifier, message: &TemplateMessage) -> Value {
        let mut components = Vec::new();

        if let Some(header) = &message.header {
            let kind = header.kind.as_str();
            let mut parameter = Map::new();
            parameter.insert("type".to_string(), json!(kind));
            parameter.insert(kind.to_string(), json!({ "id": header.media_id }));
            components.push(json!({
                "type": "header",
                "parameters": [Value::Object(parameter)],
            }));
        }
        if !message.body.is_empty() {
            let parameters: Vec<Value> = message
                .body
                .iter()
                .map(|text| json!({ "type": "text", "text": text }))
                .collect();
            components.push(json!({ "type": "body", "parameters": parameters }));
        }

        let mut template = json!({
            "name": message.template_name,
            "language": { "code": message.language_code },
        });
        if !components.is_empty() {
            template["components"] = Value::Array(components);
        }

        json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient.as_str(),
            "type": "template",
            "template": template,
        })
    }

    async fn fetch_template_page(&self, url: &str, first: bool) -> Result<TemplatePage> {
        let mut request = self.client.get(url).bearer_auth(&self.credentials.access_token);
        if first {
            request = request.query(&[
                ("status", "APPROVED".to_string()),
                ("limit", TEMPLATE_PAGE_SIZE.to_string()),
                ("fields", "name,language,status,components".to_string()),
            ]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(setup_error(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MessagingApi for WhatsAppClient {
    async fn list_approved_templates(&self) -> Result<TemplateDirectory> {
        let mut directory = TemplateDirectory::new();
        let mut url = self.endpoint(&format!(
            "{}/message_templates",
            self.credentials.business_account_id
        ));
        let mut first = true;

        loop {
            let page = self.fetch_template_page(&url, first).await?;
            for raw in page.data {
                if !raw.status.is_empty() && !raw.status.eq_ignore_ascii_case("APPROVED") {
                    continue;
                }
                let info = template_info(raw);
                directory.insert(info.name.clone(), info);
            }

            match page.paging.and_then(|p| p.next) {
                Some(next) => {
                    url = next;
                    first = false;
                }
                None => break,
            }
        }

        tracing::debug!(templates = directory.len(), "Loaded approved templates");
        Ok(directory)
    }

    async fn upload_media(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let kind = MediaKind::from_mime(mime_type)?;
        let extension = MEDIA_EXTENSIONS
            .iter()
            .find(|(_, mime)| *mime == mime_type)
            .map(|(ext, _)| *ext)
            .unwrap_or("jpeg");
        let file_name = format!("{}.{}", kind.as_str(), extension);

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_type)?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime_type.to_string())
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint(&format!("{}/media", self.credentials.phone_number_id)))
            .bearer_auth(&self.credentials.access_token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(setup_error(status, &body));
        }

        let media: MediaResponse = serde_json::from_str(&body)?;
        Ok(media.id)
    }

    async fn send_template_message(
        &self,
        recipient: &RecipientIdentifier,
        message: &TemplateMessage,
    ) -> Result<SendResult> {
        let payload = Self::build_send_payload(recipient, message);
        tracing::debug!(
            recipient = %recipient,
            template = %message.template_name,
            "Sending template message"
        );

        let response = self
            .client
            .post(self.endpoint(&format!("{}/messages", self.credentials.phone_number_id)))
            .bearer_auth(&self.credentials.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::transport(e.to_string()))?;

        if status.is_success() {
            let parsed: SendResponse = serde_json::from_str(&body)?;
            return Ok(match parsed.messages.into_iter().next() {
                Some(sent) => SendResult::Accepted {
                    message_id: sent.id,
                },
                None => SendResult::Rejected(ProviderError {
                    code: 0,
                    subcode: None,
                    http_status: Some(status.as_u16()),
                    message: "response carried no message id".to_string(),
                }),
            });
        }

        Ok(SendResult::Rejected(provider_error(status, &body)))
    }
}

fn provider_error(status: StatusCode, body: &str) -> ProviderError {
    match serde_json::from_str::<GraphErrorEnvelope>(body) {
        Ok(envelope) => ProviderError {
            code: envelope.error.code,
            subcode: envelope.error.error_subcode,
            http_status: Some(status.as_u16()),
            message: envelope.error.message,
        },
        Err(_) => ProviderError {
            code: 0,
            subcode: None,
            http_status: Some(status.as_u16()),
            message: body.chars().take(200).collect(),
        },
    }
}

/// Errors from the setup calls (template listing, media upload).
fn setup_error(status: StatusCode, body: &str) -> DispatchError {
    let error = provider_error(status, body);
    if status == StatusCode::UNAUTHORIZED || error.code == AUTH_ERROR_CODE {
        DispatchError::AuthError {
            message: error.message,
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        DispatchError::RateLimitError {
            message: error.message,
        }
    } else if status.is_server_error() {
        DispatchError::transport(format!("HTTP {}: {}", status.as_u16(), error.message))
    } else {
        DispatchError::ApiError {
            code: error.code,
            message: error.message,
        }
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder pattern is valid"))
}

fn template_info(raw: RawTemplate) -> TemplateInfo {
    let mut header_kind = HeaderKind::None;
    let mut body_variable_count = 0;

    for component in &raw.components {
        match component.kind.to_ascii_uppercase().as_str() {
            "HEADER" => {
                header_kind = component
                    .format
                    .as_deref()
                    .map(HeaderKind::from_format)
                    .unwrap_or(HeaderKind::Text);
            }
            "BODY" => {
                let from_example = component
                    .example
                    .as_ref()
                    .and_then(|example| example.body_text.first())
                    .map(Vec::len);
                body_variable_count = from_example.unwrap_or_else(|| {
                    component
                        .text
                        .as_deref()
                        .map(|text| {
                            placeholder_pattern()
                                .captures_iter(text)
                                .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
                                .collect::<HashSet<_>>()
                                .len()
                        })
                        .unwrap_or(0)
                });
            }
            _ => {}
        }
    }

    TemplateInfo {
        name: raw.name,
        language: raw.language,
        header_kind,
        body_variable_count,
    }
}
