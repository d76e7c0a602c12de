use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::Result,
    extract::{AppJson, AppPath, AppQuery},
    message::{
        message_dto::{
            ApiAck, ApiListResponse, ApiResponse, MessageQuery, PaginatedMessages,
            SendMessageRequest, UnreadCountResponse,
        },
    },
    middleware::AuthUser,
    state::AppState,
};

/// Send a message to another user
#[utoipa::path(
    post,
    path = "/api/messages",
    tag = "messages",
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message sent successfully", body = crate::message::message_models::MessageResponse),
        (status = 400, description = "Missing receiver or message"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Receiver not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppJson(payload): AppJson<SendMessageRequest>,
) -> Result<impl IntoResponse> {
    payload.validate()?;

    let message = state.message_service.send_message(&user, payload).await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

/// Get all conversations for the authenticated user
#[utoipa::path(
    get,
    path = "/api/messages/conversations",
    tag = "messages",
    responses(
        (status = 200, description = "Conversations with at least one message, most recent first", body = Vec<crate::message::message_models::ConversationResponse>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse> {
    let conversations = state.message_service.get_conversations(user.id).await?;

    Ok((StatusCode::OK, Json(ApiListResponse::ok(conversations))))
}

/// Get messages in a conversation
#[utoipa::path(
    get,
    path = "/api/messages/conversation/{conversation_id}",
    tag = "messages",
    params(
        ("conversation_id" = Uuid, Path, description = "Conversation ID"),
        MessageQuery
    ),
    responses(
        (status = 200, description = "Page of messages, oldest first", body = PaginatedMessages),
        (status = 400, description = "Invalid pagination"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppPath(conversation_id): AppPath<Uuid>,
    AppQuery(query): AppQuery<MessageQuery>,
) -> Result<impl IntoResponse> {
    query.validate()?;

    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(state.config.default_page_size);

    let (messages, total) = state
        .message_service
        .get_messages(conversation_id, user.id, page, limit)
        .await?;

    Ok((
        StatusCode::OK,
        Json(PaginatedMessages::new(messages, total, page, limit)),
    ))
}

/// Get the conversation with a specific user
#[utoipa::path(
    get,
    path = "/api/messages/conversation/user/{user_id}",
    tag = "messages",
    params(
        ("user_id" = Uuid, Path, description = "Other participant's user ID")
    ),
    responses(
        (status = 200, description = "Conversation", body = crate::message::message_models::ConversationResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No conversation with this user yet")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_conversation_by_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppPath(other_user_id): AppPath<Uuid>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .message_service
        .conversation_with(user.id, other_user_id)
        .await?;

    Ok((StatusCode::OK, Json(ApiResponse::ok(conversation))))
}

/// Mark every message from the other participant as read
#[utoipa::path(
    put,
    path = "/api/messages/{conversation_id}/read",
    tag = "messages",
    params(
        ("conversation_id" = Uuid, Path, description = "Conversation ID")
    ),
    responses(
        (status = 200, description = "Messages marked as read"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not a participant"),
        (status = 404, description = "Conversation not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn mark_as_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppPath(conversation_id): AppPath<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .message_service
        .mark_conversation_as_read(conversation_id, user.id)
        .await?;

    Ok((StatusCode::OK, Json(ApiAck::ok("Messages marked as read"))))
}

/// Delete a message (sender only)
#[utoipa::path(
    delete,
    path = "/api/messages/{id}",
    tag = "messages",
    params(
        ("id" = Uuid, Path, description = "Message ID")
    ),
    responses(
        (status = 200, description = "Message deleted"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Not the sender"),
        (status = 404, description = "Message not found")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    AppPath(message_id): AppPath<Uuid>,
) -> Result<impl IntoResponse> {
    state.message_service.delete_message(message_id, user.id).await?;

    Ok((StatusCode::OK, Json(ApiAck::ok("Message deleted successfully"))))
}

/// Total unread messages across all conversations
#[utoipa::path(
    get,
    path = "/api/messages/unread/count",
    tag = "messages",
    responses(
        (status = 200, description = "Unread message count", body = UnreadCountResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_unread_count(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse> {
    let unread_count = state.message_service.unread_count(user.id).await?;

    Ok((
        StatusCode::OK,
        Json(ApiResponse::ok(UnreadCountResponse { unread_count })),
    ))
}
