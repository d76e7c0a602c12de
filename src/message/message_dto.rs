use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use super::message_models::{Attachment, MessageResponse};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone, Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[validate(required(message = "Receiver ID is required"))]
    pub receiver_id: Option<Uuid>,
    #[validate(
        required(message = "Message is required"),
        length(min = 1, message = "Message cannot be empty")
    )]
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MessageQuery {
    /// Page number, 1-based (default: 1)
    #[validate(range(min = 1))]
    pub page: Option<u32>,
    /// Items per page (default: 50, max: 100)
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedMessages {
    pub success: bool,
    pub count: usize,
    pub data: Vec<MessageResponse>,
    pub total: i64,
    pub page: u32,
    pub pages: u32,
}

impl PaginatedMessages {
    pub fn new(data: Vec<MessageResponse>, total: i64, page: u32, limit: u32) -> Self {
        let pages = ((total.max(0) as f64) / (limit.max(1) as f64)).ceil() as u32;
        Self {
            success: true,
            count: data.len(),
            data,
            total,
            page,
            pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiListResponse<T: Serialize> {
    pub success: bool,
    pub count: usize,
    pub data: Vec<T>,
}

impl<T: Serialize> ApiListResponse<T> {
    pub fn ok(data: Vec<T>) -> Self {
        Self {
            success: true,
            count: data.len(),
            data,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiAck {
    pub success: bool,
    pub message: &'static str,
}

impl ApiAck {
    pub fn ok(message: &'static str) -> Self {
        Self {
            success: true,
            message,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountResponse {
    pub unread_count: i64,
}
