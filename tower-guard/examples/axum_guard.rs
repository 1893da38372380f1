use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::response::IntoResponse;
use axum::routing::get;
use shot_guard::EntryOptions;
use shot_guard::FlowRule;
use shot_guard::Sentinel;
use shot_guard::TrafficType;
use std::sync::Arc;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_guard::AdmissionError;
use tower_guard::GuardLayer;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Setup Rules: 10 requests per second on "hello"
    let sentinel = Sentinel::new()?;
    sentinel.load_flow_rules(vec![FlowRule {
        resource: "hello".into(),
        threshold: 10.0,
        ..Default::default()
    }])?;

    // 2. Setup Guard Layer, counting requests as inbound traffic
    let guard = GuardLayer::new(Arc::new(sentinel), "hello")
        .with_options(EntryOptions::new().traffic_type(TrafficType::Inbound));

    // 3. Build the Router
    let app = Router::new().route("/", get(|| async { "Hello, Guard!" })).layer(
        ServiceBuilder::new()
            // The outermost layer: catches BoxError and returns Response
            .layer(HandleErrorLayer::new(handle_guard_error))
            .layer(guard),
    );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app).await?;
    Ok(())
}

/// The signature must match BoxError -> IntoResponse
async fn handle_guard_error(err: BoxError) -> impl IntoResponse {
    AdmissionError::from_boxed(err).into_response()
}
