use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dispatch::DeadLetter;
use crate::error::Error;
use crate::gateway::Gateway;
use crate::mail_codec::{ContentPart, IncomingMessage};
use crate::mail_source::{AttachmentData, QueuedAttachment, SendRequest};
use crate::settings::ServerConfig;

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::AccountNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidAddress(_) | Error::Encoding(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        AppError { status, message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    #[serde(default)]
    pub sender: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub contents: Vec<ContentBody>,
    #[serde(default)]
    pub attachments: Vec<AttachmentBody>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContentBody {
    #[serde(default)]
    pub html: bool,
    pub text: String,
}

/// Attachment bytes travel base64-encoded.
#[derive(Debug, Deserialize, Serialize)]
pub struct AttachmentBody {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub message_id: String,
    pub sender_name: String,
    pub sender_address: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub date: String,
    pub contents: Vec<ContentBody>,
    pub attachments: Vec<AttachmentBody>,
    pub part_errors: Vec<String>,
}

impl SendBody {
    fn into_request(self, key: String) -> Result<SendRequest, AppError> {
        let mut request = SendRequest::new(key);
        request.sender = self.sender;
        request.recipients = self.recipients;
        request.subject = self.subject;
        request.contents = self
            .contents
            .into_iter()
            .map(|content| ContentPart { html: content.html, data: content.text.into_bytes() })
            .collect();
        for attachment in self.attachments {
            let data = BASE64.decode(attachment.data.as_bytes()).map_err(|err| AppError {
                status: StatusCode::BAD_REQUEST,
                message: format!("attachment {} is not valid base64: {}", attachment.name, err),
            })?;
            request.attachments.push(QueuedAttachment { name: attachment.name, data: AttachmentData::Inline(data) });
        }
        Ok(request)
    }
}

impl From<&IncomingMessage> for MessageView {
    fn from(message: &IncomingMessage) -> Self {
        MessageView {
            message_id: message.message_id().to_string(),
            sender_name: message.sender().name.clone(),
            sender_address: message.sender().address.clone(),
            recipients: message.recipients().iter().map(|to| to.address.clone()).collect(),
            subject: message.subject().to_string(),
            date: message.date().to_rfc3339(),
            contents: message
                .contents()
                .iter()
                .map(|content| ContentBody {
                    html: content.html,
                    text: String::from_utf8_lossy(&content.data).into_owned(),
                })
                .collect(),
            attachments: message
                .attachments()
                .iter()
                .map(|attachment| AttachmentBody { name: attachment.name.clone(), data: BASE64.encode(&attachment.data) })
                .collect(),
            part_errors: message.part_errors().iter().map(ToString::to_string).collect(),
        }
    }
}

async fn send_message(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    Json(body): Json<SendBody>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.into_request(key)?;
    let id = gateway.send(request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

async fn receive_messages(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Vec<MessageView>>, AppError> {
    let messages = gateway.receive(&key).await?;
    Ok(Json(messages.iter().map(MessageView::from).collect()))
}

async fn dead_letters(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    Ok(Json(gateway.dead_letters(&key)?))
}

pub fn create_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/messages/:key", post(send_message).get(receive_messages))
        .route("/messages/:key/dead", get(dead_letters))
        .with_state(gateway)
}

pub async fn start_web_server(config: ServerConfig, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Server running on http://{}", address);
    axum::serve(listener, create_router(gateway)).await?;
    Ok(())
}
