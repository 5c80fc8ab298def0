//! Push-channel transport: a Server-Sent Events stream per project.
//!
//! Each frame is `data: <envelope json>\n\n`. The hub's own heartbeat keeps
//! the connection alive, so axum's keep-alive comments are not enabled.

use std::convert::Infallible;
use std::sync::Arc;

use axum::http::{HeaderName, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use crate::errors::HubError;
use crate::project::ProjectId;

use super::{StreamHub, TransportKind};

/// Register a push-channel subscriber and build the streaming response.
///
/// The subscription lives inside the response body: when the client aborts
/// the request, axum drops the body and the handle is unregistered.
pub fn push_channel(hub: &Arc<StreamHub>, project_id: ProjectId) -> Result<Response, HubError> {
    let subscription = hub.subscribe(project_id.clone(), TransportKind::PushChannel)?;
    tracing::info!(project_id = %project_id, subscriber = %subscription.id(), "Push channel opened");

    let frames = subscription
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(frames),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{EventKind, HubConfig};
    use axum::Router;
    use axum::body::Body;
    use axum::extract::Path;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn router(hub: Arc<StreamHub>) -> Router {
        Router::new().route(
            "/stream/{id}",
            get(move |Path(id): Path<String>| {
                let hub = Arc::clone(&hub);
                async move {
                    let project_id = ProjectId::new(id).unwrap();
                    match push_channel(&hub, project_id) {
                        Ok(response) => response,
                        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
                    }
                }
            }),
        )
    }

    async fn next_frame(body: &mut Body) -> String {
        loop {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                return String::from_utf8(data.to_vec()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_stream_headers_and_connected_frame() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let response = router(Arc::clone(&hub))
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let mut body = response.into_body();
        let frame = next_frame(&mut body).await;
        assert!(frame.starts_with("data: "), "frame: {frame:?}");
        assert!(frame.ends_with("\n\n"), "frame: {frame:?}");

        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["data"]["projectId"], "demo");
        assert_eq!(json["data"]["transport"], "push-channel");
    }

    #[tokio::test]
    async fn test_published_events_are_streamed_in_order() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let response = router(Arc::clone(&hub))
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        next_frame(&mut body).await;

        let demo = ProjectId::new("demo").unwrap();
        hub.emit(&demo, EventKind::Message, serde_json::json!({"content": "one"}));
        hub.emit(&demo, EventKind::ToolUpdate, serde_json::json!({"tool": "edit"}));

        assert!(next_frame(&mut body).await.contains("\"content\":\"one\""));
        assert!(next_frame(&mut body).await.contains("\"type\":\"tool-update\""));
    }

    #[tokio::test]
    async fn test_dropping_body_unregisters_subscriber() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let demo = ProjectId::new("demo").unwrap();
        let response = router(Arc::clone(&hub))
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count(&demo), 1);

        drop(response);
        assert_eq!(hub.subscriber_count(&demo), 0);
        assert_eq!(
            hub.emit(&demo, EventKind::Message, serde_json::json!({})),
            0
        );
    }

    #[tokio::test]
    async fn test_rejects_when_hub_is_full() {
        let hub = Arc::new(StreamHub::new(HubConfig {
            max_subscribers: 1,
            ..HubConfig::default()
        }));
        let app = router(Arc::clone(&hub));
        let first = app
            .clone()
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::get("/stream/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
