//! Generic HTTP channel (`EX`).
//!
//! Providers without a dedicated handler post inbound messages and delivery
//! reports here. Parameters come from the query string, or from a
//! form-encoded body on POST.
//!
//! | action      | params                          | effect                 |
//! |-------------|---------------------------------|------------------------|
//! | `receive`   | `from`, `text`, `id?`, `name?`  | writes a message       |
//! | `sent`      | `id`                            | status `S`             |
//! | `delivered` | `id`                            | status `D`             |
//! | `failed`    | `id`                            | status `F`             |

use std::collections::HashMap;

use axum::extract::{Form, FromRequest, Query, Request};
use axum::http::{Method, header};
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::channel::ChannelType;
use crate::error::HandlerError;
use crate::gateway::{ActionFn, ActionResult, ChannelRequest, Gateway, action};
use crate::handler::ChannelHandler;
use crate::msg::{Msg, MsgRef, MsgStatus, MsgStatusUpdate};

/// URN scheme used when the channel config does not set `scheme`.
const DEFAULT_SCHEME: &str = "tel";

const STATUS_ACTIONS: [(&str, MsgStatus); 3] = [
    ("sent", MsgStatus::Sent),
    ("delivered", MsgStatus::Delivered),
    ("failed", MsgStatus::Failed),
];

#[derive(Debug, Default)]
pub struct ExternalHandler;

impl ExternalHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ChannelHandler for ExternalHandler {
    fn channel_type(&self) -> ChannelType {
        ChannelType::new("EX")
    }

    fn channel_name(&self) -> &str {
        "External"
    }

    fn initialize(&self, gateway: &dyn Gateway) -> Result<(), HandlerError> {
        for method in [Method::GET, Method::POST] {
            gateway.add_channel_route(self, method.clone(), "receive", action(receive))?;
            for (name, status) in STATUS_ACTIONS {
                gateway.add_channel_route(self, method.clone(), name, status_action(status))?;
            }
        }
        Ok(())
    }
}

async fn receive(req: ChannelRequest) -> ActionResult {
    let ChannelRequest {
        channel,
        gateway,
        request,
    } = req;
    let params = read_params(request).await?;

    let from = required(&params, "from")?;
    let text = params.get("text").cloned().unwrap_or_default();
    let scheme = channel.config_str("scheme").unwrap_or(DEFAULT_SCHEME);

    let mut msg = Msg::new(&channel, format!("{}:{}", scheme, from), text);
    if let Some(id) = optional(&params, "id") {
        msg = msg.with_external_id(id);
    }
    if let Some(name) = optional(&params, "name") {
        msg = msg.with_contact_name(name);
    }

    let msg_uuid = msg.uuid;
    gateway.write_msg(msg).await?;
    tracing::debug!(comp = "external", channel_uuid = %channel.uuid, %msg_uuid, "msg received");

    Ok(Json(json!({
        "message": "Message Accepted",
        "msg_uuid": msg_uuid.to_string(),
    }))
    .into_response())
}

fn status_action(status: MsgStatus) -> ActionFn {
    action(move |req| update_status(req, status))
}

async fn update_status(req: ChannelRequest, status: MsgStatus) -> ActionResult {
    let ChannelRequest {
        channel,
        gateway,
        request,
    } = req;
    let params = read_params(request).await?;

    let id = required(&params, "id")?;
    let msg = match id.parse::<i64>() {
        Ok(id) => MsgRef::Id(id),
        Err(_) => MsgRef::ExternalId(id.to_string()),
    };

    gateway
        .write_msg_status(MsgStatusUpdate::new(&channel, msg, status))
        .await?;

    Ok(Json(json!({
        "message": "Status Update Accepted",
        "status": status.code(),
    }))
    .into_response())
}

/// Query parameters, merged with the form body of a form-encoded POST.
async fn read_params(request: Request) -> Result<HashMap<String, String>, HandlerError> {
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map_err(|e| HandlerError::BadRequest(e.body_text()))?;

    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    if request.method() == Method::POST && is_form {
        let Form(form) = Form::<HashMap<String, String>>::from_request(request, &())
            .await
            .map_err(|e| HandlerError::BadRequest(e.body_text()))?;
        params.extend(form);
    }
    Ok(params)
}

fn required<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, HandlerError> {
    optional(params, key)
        .ok_or_else(|| HandlerError::BadRequest(format!("missing required parameter '{}'", key)))
}

fn optional<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}
