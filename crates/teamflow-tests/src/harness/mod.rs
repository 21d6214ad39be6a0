pub mod client;
pub mod node;

use std::time::Duration;
use teamflow::client::error_code;
use teamflow::protocol::{ErrorCode, Response, SessionContext, StepView};

/// Poll `check` against fresh session contexts until it holds, or timeout.
pub async fn poll_context_until<F>(
    client: &mut client::TestClient,
    session_id: &str,
    timeout: Duration,
    mut check: F,
) -> SessionContext
where
    F: FnMut(&SessionContext) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let ctx = client
            .context(session_id)
            .await
            .expect("session context should load");
        if check(&ctx) || tokio::time::Instant::now() >= deadline {
            return ctx;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("teamflow_node=debug,teamflow_store=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// The step of `ctx` whose template step is named `name`.
pub fn step_named<'a>(ctx: &'a SessionContext, name: &str) -> &'a StepView {
    ctx.steps
        .iter()
        .find(|s| s.content.as_ref().is_some_and(|c| c.name == name))
        .unwrap_or_else(|| panic!("no visible step named {name}"))
}

/// Assert that a request failed with `expected`.
pub fn assert_code<T: std::fmt::Debug>(result: anyhow::Result<T>, expected: ErrorCode) {
    match result {
        Ok(v) => panic!("expected {expected}, got Ok({v:?})"),
        Err(e) => assert_eq!(error_code(&e), Some(expected), "unexpected error: {e:#}"),
    }
}

/// Extract data from an Ok response, or panic.
pub fn unwrap_ok_data(resp: Response) -> Option<serde_json::Value> {
    match resp {
        Response::Ok { data } => data,
        Response::Error { code, message } => panic!("expected Ok, got Error({code}): {message}"),
        other => panic!("expected Ok, got {other:?}"),
    }
}
