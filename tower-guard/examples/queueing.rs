use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use shot_guard::FlowRule;
use shot_guard::Sentinel;
use shot_guard::flow::ControlBehavior;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower_guard::AdmissionError;
use tower_guard::GuardLayer;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Setup Rules: 20 requests per second, spaced 50ms apart, queueing
    // for at most 500ms
    let sentinel = Sentinel::new()?;
    sentinel.load_flow_rules(vec![FlowRule {
        resource: "work".into(),
        threshold: 20.0,
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 500,
        ..Default::default()
    }])?;
    let layer = GuardLayer::new(Arc::new(sentinel), "work");

    // 2. Define a "Work" service
    let service = tower::service_fn(|_: ()| async {
        // Simulate a tiny bit of processing time
        sleep(Duration::from_millis(1)).await;
        Ok::<&str, BoxError>("Request Successful")
    });
    let guarded = layer.layer(service);

    println!("🚀 Firing 20 requests at once...");
    println!("Rule: Throttling (20/s, 500ms queue)\n");

    // 3. About ten fit in the queue, the rest are blocked
    let start = Instant::now();
    let mut tasks = Vec::new();
    for i in 0..20 {
        let mut svc = guarded.clone();
        tasks.push(tokio::spawn(async move {
            match ServiceExt::<()>::ready(&mut svc).await {
                Ok(ready_svc) => match ready_svc.call(()).await {
                    Ok(resp) => println!("[{i:02}] ✅ {resp} after {:?}", start.elapsed()),
                    Err(e) => println!("[{i:02}] 💥 Unexpected Error: {e}"),
                },
                Err(e) => println!("[{i:02}] ❌ {}", AdmissionError::from_boxed(e)),
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    println!("\n🏁 Done.");
    Ok(())
}
