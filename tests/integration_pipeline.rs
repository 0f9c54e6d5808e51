mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pipex::prelude::*;
use pipex::send_next;

use common::{MockTransport, ResponseSpec, ScriptedOutcome, spawn_scripted_server};

fn pipeline_over(
    transport: Arc<MockTransport>,
    retry: RetryPolicy,
) -> Pipeline {
    Pipeline::builder()
        .client_name("pipex-tests")
        .transport(transport)
        .retry(retry)
        .build()
        .expect("default chain builds")
}

#[derive(Debug, Default)]
struct CountingPolicy {
    invocations: AtomicUsize,
}

#[async_trait]
impl Policy for CountingPolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        send_next(context, request, next).await
    }
}

#[tokio::test(start_paused = true)]
async fn retry_issues_at_most_max_attempts_and_surfaces_last_response() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(503),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let response = pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("exhaustion surfaces the last response, not a synthetic error");

    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(transport.sends(), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_after_header_takes_precedence_over_configured_backoff() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(429).header("retry-after", "5"),
        ScriptedOutcome::response(200).body(&b"ok"[..]),
    ]);
    let pipeline = pipeline_over(
        Arc::clone(&transport),
        RetryPolicy::standard()
            .max_attempts(3)
            .base_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(50)),
    );

    let response = pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status().as_u16(), 200);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    let delay = requests[1].sent_at - requests[0].sent_at;
    assert!(
        delay >= Duration::from_secs(5) && delay < Duration::from_millis(5_100),
        "retry-after must be honored verbatim, observed {delay:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_are_monotonically_non_decreasing() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(200),
    ]);
    let pipeline = pipeline_over(
        Arc::clone(&transport),
        RetryPolicy::standard()
            .max_attempts(4)
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10)),
    );

    pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("final attempt succeeds");

    let requests = transport.requests();
    assert_eq!(requests.len(), 4);
    let mut previous = Duration::ZERO;
    for pair in requests.windows(2) {
        let delay = pair[1].sent_at - pair[0].sent_at;
        assert!(
            delay >= previous,
            "inter-attempt delay shrank: {delay:?} after {previous:?}"
        );
        previous = delay;
    }
}

#[tokio::test(start_paused = true)]
async fn post_without_idempotency_key_is_never_retried() {
    let transport = MockTransport::script([ScriptedOutcome::response(503)]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let response = pipeline
        .run(
            &Context::new(),
            Request::post("https://api.example.com/v1/widgets").set_body(&b"{}"[..]),
        )
        .await
        .expect("single attempt surfaces its response");

    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(transport.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn post_with_idempotency_key_is_retried() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(201),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let request = Request::post("https://api.example.com/v1/widgets")
        .idempotency_key("create-widget-001")
        .expect("key is a valid header value")
        .set_body(&b"{}"[..]);
    let response = pipeline
        .run(&Context::new(), request)
        .await
        .expect("retry succeeds");

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(transport.sends(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_retry_then_surface_the_last_error() {
    let transport = MockTransport::script([
        ScriptedOutcome::transport_error(),
        ScriptedOutcome::transport_error(),
        ScriptedOutcome::transport_error(),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let error = pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect_err("all attempts fail");

    assert_eq!(error.code(), ErrorCode::Transport);
    assert_eq!(error.transport_kind(), Some(TransportErrorKind::Connect));
    assert_eq!(transport.sends(), 3);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_status_passes_through_with_its_error_kind() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(404).body(&b"no such widget"[..]),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let response = pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets/w1"))
        .await
        .expect("non-retryable response is returned, not retried");
    assert_eq!(transport.sends(), 1);

    let error = response
        .error_for_status()
        .await
        .expect_err("404 maps to an error");
    assert_eq!(error.http_status(), Some(404));
    assert_eq!(error.http_error_kind(), Some(HttpErrorKind::NotFound));
}

#[tokio::test(start_paused = true)]
async fn per_call_policies_run_once_and_per_retry_policies_run_per_attempt() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(200),
    ]);
    let per_call = Arc::new(CountingPolicy::default());
    let per_retry = Arc::new(CountingPolicy::default());
    let pipeline = Pipeline::builder()
        .transport(transport)
        .retry(
            RetryPolicy::standard()
                .max_attempts(3)
                .base_backoff(Duration::from_millis(10)),
        )
        .per_call_policy(Arc::clone(&per_call) as Arc<dyn Policy>)
        .per_retry_policy(Arc::clone(&per_retry) as Arc<dyn Policy>)
        .build()
        .expect("chain builds");

    pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("third attempt succeeds");

    assert_eq!(per_call.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(per_retry.invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn per_retry_policies_without_a_retry_anchor_fail_at_build_time() {
    let transport = MockTransport::script([]);
    let error = Pipeline::builder()
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .policies(vec![Arc::new(CountingPolicy::default())])
        .per_retry_policy(Arc::new(CountingPolicy::default()))
        .build()
        .expect_err("configuration error must surface before any request");

    assert_eq!(error.code(), ErrorCode::Configuration);
    assert_eq!(transport.sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_aborts_before_the_next_attempt() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503).header("retry-after", "60"),
        ScriptedOutcome::response(200),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));

    let token = CancellationToken::new();
    let context = Context::new().with_cancellation(token.clone());
    let started = tokio::time::Instant::now();

    let cancel = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    };
    let (outcome, ()) = tokio::join!(
        pipeline.run(&context, Request::get("https://api.example.com/v1/widgets")),
        cancel
    );

    let error = outcome.expect_err("cancellation aborts the call");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(transport.sends(), 1, "no attempt may start after cancellation");
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "backoff must not be slept out after cancellation"
    );
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_retry_backoff() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503).header("retry-after", "30"),
        ScriptedOutcome::response(200),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(3));
    let context = Context::new().with_timeout(Duration::from_secs(5));

    let error = pipeline
        .run(&context, Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect_err("backoff past the deadline fails fast");
    assert_eq!(error.code(), ErrorCode::DeadlineExceeded);
    assert_eq!(transport.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn handle_awaited_twice_issues_a_single_network_call() {
    let transport = MockTransport::script([ScriptedOutcome::response(200).body(&b"payload"[..])]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::disabled());

    let mut handle = pipeline.send(
        &Context::new(),
        Request::get("https://api.example.com/v1/widgets/w1"),
    );
    let first = handle.get().await.expect("first await").collect().await.expect("body");
    let second = handle.get().await.expect("second await").collect().await.expect("body");

    assert_eq!(first, second);
    assert_eq!(transport.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn scoped_handle_releases_the_response_exactly_once() {
    let transport = MockTransport::script([ScriptedOutcome::response(200).body(&b"unread"[..])]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::disabled());

    let mut handle = pipeline.send(
        &Context::new(),
        Request::get("https://api.example.com/v1/widgets/w1"),
    );
    {
        let scoped = handle.scoped().await.expect("scoped acquisition");
        assert_eq!(scoped.status().as_u16(), 200);
        // Body intentionally never read.
    }
    assert_eq!(
        transport.releases(),
        1,
        "scope exit must release the transport resource exactly once"
    );

    // A second scope over the memoized response must not release again.
    {
        let _scoped = handle.scoped().await.expect("scoped reacquisition");
    }
    assert_eq!(transport.releases(), 1);
    assert_eq!(transport.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_retry_responses_release_their_connections() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(200),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(2));

    let mut response = pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("retry succeeds");
    assert_eq!(transport.releases(), 1, "the abandoned 503 must be released");
    response.close();
    assert_eq!(transport.releases(), 2);
}

#[tokio::test(start_paused = true)]
async fn request_id_is_stamped_once_and_stable_across_attempts() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(503),
        ScriptedOutcome::response(200),
    ]);
    let pipeline = pipeline_over(Arc::clone(&transport), RetryPolicy::standard().max_attempts(2));

    pipeline
        .run(&Context::new(), Request::get("https://api.example.com/v1/widgets"))
        .await
        .expect("retry succeeds");

    let requests = transport.requests();
    let first_id = requests[0]
        .header("x-client-request-id")
        .expect("request id stamped");
    let second_id = requests[1]
        .header("x-client-request-id")
        .expect("request id stamped");
    assert_eq!(first_id, second_id, "per-call policies run before retry");
}

#[tokio::test]
async fn hyper_transport_retries_against_a_real_server() {
    let (base_url, server) = spawn_scripted_server(vec![
        ResponseSpec::new(500, Vec::<(String, String)>::new(), &b"boom"[..]),
        ResponseSpec::new(200, Vec::<(String, String)>::new(), &b"recovered"[..]),
    ]);
    let pipeline = Pipeline::builder()
        .client_name("pipex-tests")
        .retry(
            RetryPolicy::standard()
                .max_attempts(2)
                .base_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_millis(20)),
        )
        .build()
        .expect("default chain builds");

    let mut response = pipeline
        .run(&Context::new(), Request::get(format!("{base_url}/v1/widgets")))
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.collect().await.expect("body");
    assert_eq!(body, &b"recovered"[..]);

    server.join().expect("server thread exits cleanly");
}
