//! axum middleware that runs a route's command and delivers its outcome.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use tau_exec::{
    CommandDispatcher, Dispatch, EncodedResponse, StreamDelivery, StreamEvent, SSE_CACHE_CONTROL,
};
use tokio_stream::StreamExt;

use crate::request_placeholders::request_placeholder_resolver;

/// Dispatches the route command; the wrapped handler runs only on pass-through.
pub async fn exec_middleware(
    State(dispatcher): State<CommandDispatcher>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let resolver = request_placeholder_resolver(&request, remote);

    match dispatcher
        .dispatch(&resolver, dispatcher.trigger_scope())
        .await
    {
        Dispatch::Respond(encoded) => encoded_into_response(encoded),
        Dispatch::Stream(delivery) => stream_into_response(delivery),
        Dispatch::Continue => next.run(request).await,
    }
}

fn encoded_into_response(encoded: EncodedResponse) -> Response {
    let status =
        StatusCode::from_u16(encoded.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, encoded.content_type)],
        encoded.body,
    )
        .into_response()
}

fn stream_event(event: StreamEvent) -> Event {
    Event::default()
        .event(event.sse_event_name())
        .data(event.sse_data())
}

fn stream_into_response(delivery: StreamDelivery) -> Response {
    let events = delivery.map(|event| Ok::<Event, Infallible>(stream_event(event)));
    let mut response = Sse::new(events).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(SSE_CACHE_CONTROL),
    );
    response
}
