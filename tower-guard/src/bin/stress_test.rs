use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use hdrhistogram::Histogram;
use rand::Rng;
use shot_guard::FlowRule;
use shot_guard::Sentinel;
use shot_guard::flow::ControlBehavior;
use shot_guard::flow::TokenCalculateStrategy;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::service_fn;
use tower_guard::AdmissionError;
use tower_guard::GuardLayer;

const RESOURCE: &str = "db";

async fn mock_db_call(_req: ()) -> Result<&'static str, BoxError> {
    // Simulate real-world work with 5-15ms of jittered DB latency
    let latency = rand::rng().random_range(5..15);
    sleep(Duration::from_millis(latency)).await;
    Ok("success")
}

#[derive(Default)]
struct RejectionCounter {
    blocked: usize,
    not_ready: usize,
    inner: usize,
    unknown: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize)
where
    S: Service<(), Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    let mut hist_ready = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3).unwrap();

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();

    let barrier = Arc::new(Barrier::new(total_reqs));

    for _ in 0..total_reqs {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let ready_res = local_svc.ready().await;
            let ready = req_start.elapsed();

            if let Ok(ready_svc) = ready_res {
                let res = ready_svc.call(()).await;
                (res, ready, req_start.elapsed())
            } else {
                (ready_res.map(|_| ""), ready, req_start.elapsed())
            }
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, ready, elapsed) = task.expect("Task panicked");
        match res {
            Ok(_) => {
                success_count += 1;
                hist_ready.record(ready.as_nanos() as u64).unwrap();
                hist_elapsed.record(elapsed.as_micros() as u64).unwrap();
            }
            Err(e) => {
                if let Some(err) = e.downcast_ref::<AdmissionError>() {
                    match err {
                        AdmissionError::Blocked(_) => rejections.blocked += 1,
                        AdmissionError::NotReady => rejections.not_ready += 1,
                        AdmissionError::Inner(_) => rejections.inner += 1,
                    }
                } else if e.is::<tower::load_shed::error::Overloaded>() {
                    rejections.blocked += 1;
                } else {
                    rejections.unknown += 1;
                }
            }
        }
    }

    let total_duration = start.elapsed();
    let throughput = total_reqs as f64 / total_duration.as_secs_f64();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Total Rate:      {:.2} req/sec", throughput);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.99));
        println!("P50 (Ready):     {}ns", hist_ready.value_at_quantile(0.5));
        println!("P99 (Ready):     {}ns", hist_ready.value_at_quantile(0.99));
    }

    let total_errors = rejections.blocked + rejections.not_ready + rejections.inner + rejections.unknown;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Blocked:    {}", rejections.blocked);
        if rejections.not_ready > 0 {
            println!("  └─ NotReady:   {}", rejections.not_ready);
        }
        if rejections.inner > 0 {
            println!("  └─ Inner:      {}", rejections.inner);
        }
        if rejections.unknown > 0 {
            println!("  └─ Unknown:    {}", rejections.unknown);
        }
    }
    println!();
}

fn guarded(rule: FlowRule) -> Result<GuardLayer, BoxError> {
    let sentinel = Sentinel::new()?;
    sentinel.load_flow_rules(vec![rule])?;
    Ok(GuardLayer::new(Arc::new(sentinel), RESOURCE))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let threshold = 10_000.0;
    let total_reqs = 50_000;
    let base = FlowRule {
        resource: RESOURCE.into(),
        threshold,
        ..Default::default()
    };

    // 1. Direct rejection
    let direct = guarded(base.clone())?.layer(service_fn(mock_db_call));
    run_load_test("Guard Direct", direct, total_reqs).await;

    // 2. Throttling with a 500ms queue
    let throttling = guarded(FlowRule {
        control_behavior: ControlBehavior::Throttling,
        max_queueing_time_ms: 500,
        ..base.clone()
    })?
    .layer(service_fn(mock_db_call));
    run_load_test("Guard Throttling", throttling, total_reqs).await;

    // 3. Warm-up from a cold start
    let warm_up = guarded(FlowRule {
        token_calculate_strategy: TokenCalculateStrategy::WarmUp,
        warm_up_period_sec: 10,
        ..base
    })?
    .layer(service_fn(mock_db_call));
    run_load_test("Guard WarmUp", warm_up, total_reqs).await;

    // 4. Tower Built-in with load shedding
    let tower_svc = ServiceBuilder::new()
        .load_shed()
        .buffer(threshold as usize)
        .rate_limit(threshold as u64, Duration::from_secs(1))
        .service(service_fn(mock_db_call));
    run_load_test("Shedding Tower RateLimit", tower_svc, total_reqs).await;

    Ok(())
}
