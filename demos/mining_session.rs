//! A miniature mining session against an in-process pool.
//!
//! The pool answers `mining.subscribe` with a subject-tuple result and
//! immediately pushes a job notification. The client subscribes, then
//! transitions from its subscribing state to a working state whose
//! vocabulary accepts the job push.
//!
//! ```bash
//! RUST_LOG=stratum_core=trace cargo run --example mining_session
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use stratum_core::{
    ArrayResult, ConnectionState, Request, Response, ResponseKind, ResponseVariant, ResultData,
    ServerConfig, StateFactory, StatefulTransport, SubjectTuple, TcpClient, TcpServer,
    generic_request_parser, next_request_id,
};

const SUBSCRIBE: ResponseKind = ResponseKind("mining.subscribe");

/// The pool side: one state that answers subscriptions and pushes work.
fn pool_state() -> Arc<ConnectionState> {
    ConnectionState::builder("serving")
        .request_handler(
            "mining.subscribe",
            generic_request_parser(),
            Arc::new(|transport: &Arc<StatefulTransport>, request: &Request| {
                let id = request.id().unwrap_or("0").to_string();
                let result = ResultData::Array(ArrayResult::with_subject(
                    SubjectTuple::with_key("mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"),
                    vec![json!("08000002"), json!(4)],
                ));
                let _ = transport.send_response(Response::success(id, result));

                if let Ok(job) =
                    Request::new(None, "mining.notify", vec![json!("job-1"), json!("1a44dd")])
                {
                    let _ = transport.send_request(job);
                }
            }),
        )
        .expect("empty state accepts the first registration")
        .build()
}

/// The client once subscribed: accepts job pushes.
fn working_state() -> Arc<ConnectionState> {
    ConnectionState::builder("working")
        .request_handler(
            "mining.notify",
            generic_request_parser(),
            Arc::new(|_transport, request: &Request| {
                println!("job received: {:?}", request.params());
            }),
        )
        .expect("empty state accepts the first registration")
        .build()
}

/// The client's post-connect state: only the subscribe response is legal.
fn subscribing_state(working: Arc<ConnectionState>) -> Arc<ConnectionState> {
    ConnectionState::builder("subscribing")
        .response_handler(
            SUBSCRIBE,
            Arc::new(move |transport: &Arc<StatefulTransport>, response: &Response| {
                println!("subscribed: {:?}", response.result());
                transport.set_state(Arc::clone(&working));
            }),
        )
        .expect("empty state accepts the first registration")
        .build()
}

#[tokio::main]
async fn main() -> stratum_core::StratumResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = TcpServer::new(ServerConfig::default());
    let factory: StateFactory = Arc::new(|_transport| pool_state());
    tokio::spawn(async move {
        let _ = server.listen(listener, factory).await;
    });

    let client = TcpClient::new();
    client
        .connect(&addr.to_string(), subscribing_state(working_state()))
        .await?;

    let request = Request::new(
        Some(next_request_id()),
        "mining.subscribe",
        vec![json!("stratum-core-demo/0.1.0")],
    )?;
    client
        .transport()
        .send_request_expecting(request, ResponseVariant::generic(SUBSCRIBE))?;

    // Give the round trip a moment, then tear down.
    tokio::time::sleep(Duration::from_millis(250)).await;
    client.transport().close();
    Ok(())
}
