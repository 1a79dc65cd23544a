//! HTTP ingestion endpoint.
//!
//! Every path is a topic: `GET /<topic>?message=a&message=b` enqueues one
//! message per value, `POST /<topic>` enqueues the body as a single message.
//! The topic is the path without its leading `/`; an empty topic (`/`) is
//! passed through to the broker unvalidated.
//!
//! Enqueueing may suspend the request while the outbound queue is full, which
//! is how broker slowness turns into HTTP latency instead of dropped data.

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, PathRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tracing::{info, warn};

use crate::bridge::queue::{OutboundQueue, QueueError};
use crate::mqtt::message::BridgeMessage;

pub const MESSAGE_PARAM: &str = "message";
pub const METHOD_NOT_ALLOWED_BODY: &str = "Only GET and POST methods are allowed.";
pub const BAD_BODY_BODY: &str = "Unable to parse message body";
pub const BAD_TOPIC_BODY: &str = "Unable to decode topic";
pub const SHUTTING_DOWN_BODY: &str = "Bridge is shutting down";

type QueryPairs = Option<Query<Vec<(String, String)>>>;

pub fn router(queue: OutboundQueue, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", any(ingest_root))
        .route("/*topic", any(ingest_topic))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(queue)
}

async fn ingest_root(
    State(queue): State<OutboundQueue>,
    method: Method,
    query: QueryPairs,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    ingest(&queue, Ok(String::new()), method, query, body).await
}

async fn ingest_topic(
    State(queue): State<OutboundQueue>,
    path: Result<Path<String>, PathRejection>,
    method: Method,
    query: QueryPairs,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let topic = path.map(|Path(topic)| match topic.strip_prefix('/') {
        Some(stripped) => stripped.to_string(),
        None => topic,
    });
    ingest(&queue, topic, method, query, body).await
}

async fn ingest(
    queue: &OutboundQueue,
    topic: Result<String, PathRejection>,
    method: Method,
    query: QueryPairs,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if method != Method::GET && method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, POST")],
            METHOD_NOT_ALLOWED_BODY,
        )
            .into_response();
    }

    let topic = match topic {
        Ok(topic) => topic,
        Err(rejection) => {
            warn!("Unable to decode topic: {}", rejection);
            return (StatusCode::BAD_REQUEST, BAD_TOPIC_BODY).into_response();
        }
    };
    info!("Topic: {}", topic);

    if method == Method::GET {
        let values = query
            .map(|Query(pairs)| pairs)
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| key == MESSAGE_PARAM)
            .map(|(_, value)| value);

        for value in values {
            if let Err(e) = queue.enqueue(BridgeMessage::new(topic.clone(), value)).await {
                return rejected(e);
            }
        }
        return StatusCode::OK.into_response();
    }

    match body {
        Ok(payload) => match queue.enqueue(BridgeMessage::new(topic, payload)).await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(e) => rejected(e),
        },
        Err(rejection) => {
            warn!("Unable to read body for topic {}: {}", topic, rejection);
            (StatusCode::BAD_REQUEST, BAD_BODY_BODY).into_response()
        }
    }
}

fn rejected(error: QueueError) -> Response {
    warn!("Rejecting request: {}", error);
    (StatusCode::SERVICE_UNAVAILABLE, SHUTTING_DOWN_BODY).into_response()
}
