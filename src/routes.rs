use crate::{
    message::{
        message_dto::{PaginatedMessages, SendMessageRequest, UnreadCountResponse},
        message_handlers,
        message_models::{Attachment, ConversationResponse, MessageResponse},
    },
    middleware::auth_middleware,
    state::AppState,
    user::UserProfile,
};
use axum::http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::message::message_handlers::send_message,
        crate::message::message_handlers::get_conversations,
        crate::message::message_handlers::get_messages,
        crate::message::message_handlers::get_conversation_by_user,
        crate::message::message_handlers::mark_as_read,
        crate::message::message_handlers::delete_message,
        crate::message::message_handlers::get_unread_count,
    ),
    components(
        schemas(
            SendMessageRequest,
            PaginatedMessages,
            UnreadCountResponse,
            MessageResponse,
            ConversationResponse,
            Attachment,
            UserProfile,
        )
    ),
    tags(
        (name = "messages", description = "Direct messaging endpoints")
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            )
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let message_routes = Router::new()
        .route("/", post(message_handlers::send_message))
        .route("/conversations", get(message_handlers::get_conversations))
        .route(
            "/conversation/:conversation_id",
            get(message_handlers::get_messages),
        )
        .route(
            "/conversation/user/:user_id",
            get(message_handlers::get_conversation_by_user),
        )
        .route("/unread/count", get(message_handlers::get_unread_count))
        .route("/:id/read", put(message_handlers::mark_as_read))
        .route("/:id", delete(message_handlers::delete_message))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // WebSocket route
    let ws_routes = Router::new()
        .route("/ws", get(crate::websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let api_routes = Router::new()
        .nest("/messages", message_routes)
        .merge(ws_routes);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::create_jwt,
        message::InMemoryMessageStore,
        state::Config,
        user::InMemoryUserDirectory,
        websocket::InMemoryPresence,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "router-test-secret";

    struct TestApp {
        router: Router,
        state: AppState,
        alice: UserProfile,
        bob: UserProfile,
        carol: UserProfile,
        inactive: UserProfile,
    }

    fn profile(email: &str, is_active: bool) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name: None,
            avatar_url: None,
            is_active,
        }
    }

    fn app() -> TestApp {
        let alice = profile("alice@example.com", true);
        let bob = profile("bob@example.com", true);
        let carol = profile("carol@example.com", true);
        let inactive = profile("gone@example.com", false);

        let config = Config::from_lookup(|key| (key == "JWT_SECRET").then(|| SECRET.to_string()))
            .unwrap();
        let state = AppState::new(
            config,
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(InMemoryUserDirectory::new([
                alice.clone(),
                bob.clone(),
                carol.clone(),
                inactive.clone(),
            ])),
            Arc::new(InMemoryPresence::new()),
        );

        TestApp {
            router: create_router(state.clone()),
            state,
            alice,
            bob,
            carol,
            inactive,
        }
    }

    fn token(user: &UserProfile) -> String {
        create_jwt(user.id, &user.email, SECRET, 1)
    }

    async fn call(
        app: &TestApp,
        method: Method,
        uri: &str,
        as_user: Option<&UserProfile>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = as_user {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token(user)));
        }
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn send(app: &TestApp, from: &UserProfile, to: &UserProfile, text: &str) -> Value {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/messages",
            Some(from),
            Some(json!({ "receiverId": to.id, "message": text })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"].clone()
    }

    #[tokio::test]
    async fn test_send_and_read_back() {
        let app = app();
        let sent = send(&app, &app.alice, &app.bob, "hello").await;
        assert_eq!(sent["message"], "hello");
        assert_eq!(sent["sender"]["email"], "alice@example.com");
        let conversation_id = sent["conversationId"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::GET, "/api/messages/conversations", Some(&app.bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["unreadCount"], 1);
        assert_eq!(body["data"][0]["lastMessage"], "hello");

        let uri = format!("/api/messages/conversation/{}?page=1&limit=10", conversation_id);
        let (status, body) = call(&app, Method::GET, &uri, Some(&app.bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["pages"], 1);
        assert_eq!(body["data"][0]["message"], "hello");

        let (_, body) = call(&app, Method::GET, "/api/messages/unread/count", Some(&app.bob), None).await;
        assert_eq!(body["data"]["unreadCount"], 1);

        let uri = format!("/api/messages/{}/read", conversation_id);
        let (status, body) = call(&app, Method::PUT, &uri, Some(&app.bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Messages marked as read");

        let (_, body) = call(&app, Method::GET, "/api/messages/unread/count", Some(&app.bob), None).await;
        assert_eq!(body["data"]["unreadCount"], 0);
    }

    #[tokio::test]
    async fn test_send_validation_and_unknown_receiver() {
        let app = app();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/messages",
            Some(&app.alice),
            Some(json!({ "message": "no receiver" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/messages",
            Some(&app.alice),
            Some(json!({ "receiverId": Uuid::new_v4(), "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/messages",
            Some(&app.alice),
            Some(json!("not an object")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_outsider_is_forbidden() {
        let app = app();
        let sent = send(&app, &app.alice, &app.bob, "private").await;
        let conversation_id = sent["conversationId"].as_str().unwrap();

        let uri = format!("/api/messages/conversation/{}", conversation_id);
        let (status, body) = call(&app, Method::GET, &uri, Some(&app.carol), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Not authorized to access this conversation");

        let uri = format!("/api/messages/{}/read", conversation_id);
        let (status, _) = call(&app, Method::PUT, &uri, Some(&app.carol), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let uri = format!("/api/messages/{}", sent["id"].as_str().unwrap());
        let (status, _) = call(&app, Method::DELETE, &uri, Some(&app.bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&app, Method::DELETE, &uri, Some(&app.alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Message deleted successfully");
    }

    #[tokio::test]
    async fn test_conversation_by_user_and_pagination_bounds() {
        let app = app();
        let uri = format!("/api/messages/conversation/user/{}", app.bob.id);
        let (status, _) = call(&app, Method::GET, &uri, Some(&app.alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let sent = send(&app, &app.alice, &app.bob, "hi").await;
        let (status, body) = call(&app, Method::GET, &uri, Some(&app.alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], sent["conversationId"]);
        assert_eq!(body["data"]["participant"]["email"], "bob@example.com");

        let conversation_id = sent["conversationId"].as_str().unwrap();
        for query in ["page=0", "limit=0", "limit=101", "page=abc"] {
            let uri = format!("/api/messages/conversation/{}?{}", conversation_id, query);
            let (status, _) = call(&app, Method::GET, &uri, Some(&app.alice), None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "query {}", query);
        }

        let (status, _) = call(&app, Method::GET, "/api/messages/conversation/not-a-uuid", Some(&app.alice), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authentication_failures() {
        let app = app();

        let (status, _) = call(&app, Method::GET, "/api/messages/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, Method::GET, "/api/messages/conversations", Some(&app.inactive), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let stranger = profile("stranger@example.com", true);
        let (status, _) = call(&app, Method::GET, "/api/messages/conversations", Some(&stranger), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/messages/conversations")
            .header(AUTHORIZATION, format!("Bearer {}", create_jwt(app.alice.id, "", SECRET, -2)))
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unauthenticated_handshake_never_connects() {
        let app = app();

        let request = Request::builder()
            .uri("/api/ws?token=garbage")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.state.gateway.connections().session_count(), 0);
        assert!(!app.state.gateway.connections().is_connected(app.alice.id));
    }

    #[test]
    fn test_openapi_references_response_schemas() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let schema_ref = |path: &str, method: &str, status: &str| {
            doc["paths"][path][method]["responses"][status]["content"]["application/json"]["schema"]
                .clone()
        };

        assert_eq!(
            schema_ref("/api/messages", "post", "201")["$ref"],
            "#/components/schemas/MessageResponse"
        );
        assert_eq!(
            schema_ref("/api/messages/conversations", "get", "200")["items"]["$ref"],
            "#/components/schemas/ConversationResponse"
        );
        for name in ["MessageResponse", "ConversationResponse", "Attachment"] {
            assert!(doc["components"]["schemas"].get(name).is_some(), "{} missing", name);
        }
    }
}
