use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::MeshError;

use super::{
    connection::{self, Connection, Frame, FrameSink, FrameStream},
    Direction, MeshShared,
};

pub const AUTH_TOKEN_HEADER: &str = "auth_token";
pub const NODE_ID_HEADER: &str = "node_id";

pub(super) fn router(shared: Arc<MeshShared>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", get(accept_peer))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn authenticate(shared: &MeshShared, headers: &HeaderMap) -> Result<(), MeshError> {
    match header(headers, AUTH_TOKEN_HEADER) {
        Some(token) if token == shared.settings.auth_token => Ok(()),
        _ => Err(MeshError::Authentication),
    }
}

/// Liveness probe used by discovery. The caller must know both the secret
/// and which node it expects to be talking to.
async fn health(State(shared): State<Arc<MeshShared>>, headers: HeaderMap) -> Response {
    if let Err(err) = authenticate(&shared, &headers) {
        return err.into_response();
    }
    if header(&headers, NODE_ID_HEADER) != Some(shared.settings.node_id.as_str()) {
        return (StatusCode::BAD_REQUEST, "Perhaps my id has changed.").into_response();
    }
    (StatusCode::OK, "Good. Thanks for asking!").into_response()
}

async fn accept_peer(
    State(shared): State<Arc<MeshShared>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, MeshError> {
    authenticate(&shared, &headers)?;
    let peer_id = match header(&headers, NODE_ID_HEADER) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(MeshError::Handshake("missing node_id header".into())),
    };
    if peer_id == shared.settings.node_id {
        return Err(MeshError::Handshake("peer claims our own node id".into()));
    }
    if !shared.would_admit(&peer_id, Direction::Accepted).await {
        return Err(MeshError::DuplicateConnection { peer_id });
    }

    Ok(upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(MeshError::transport)
            .with(|frame: Frame| futures_util::future::ready(Ok::<_, MeshError>(frame.into())));
        let stream = stream.map(|item| item.map(Frame::from).map_err(MeshError::transport));
        let mut sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);

        // Someone may have claimed the id while we were upgrading.
        let registration = match shared.register(&peer_id, Direction::Accepted).await {
            Ok(registration) => registration,
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "dropping upgraded connection");
                let _ = sink.send(Frame::Close).await;
                return;
            }
        };

        info!(peer = %peer_id, "new peer");
        connection::run(
            Arc::clone(&shared),
            Connection::new(peer_id, sink, stream, registration),
        )
        .await;
    }))
}
