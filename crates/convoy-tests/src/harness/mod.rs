pub mod client;
pub mod node;

use convoy::protocol::{ErrorCode, Event, Response};
use std::time::Duration;

/// Token of every test account: `<name>-token`.
pub fn token_for(account: &str) -> String {
    format!("{account}-token")
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("convoy=debug,convoy_node=debug,convoy_fleet=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Extract data from a result response, or panic.
pub fn unwrap_ok_data(resp: Response) -> Option<serde_json::Value> {
    match resp {
        Response::Result { data, .. } => data,
        Response::Error { code, error, .. } => panic!("expected result, got error({code}): {error}"),
        other => panic!("expected result, got {other:?}"),
    }
}

/// Error code of an error response, or panic.
pub fn unwrap_error_code(resp: &Response) -> ErrorCode {
    match resp.error_code() {
        Some(code) => code,
        None => panic!("expected error, got {resp:?}"),
    }
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn wait_for_event(
    client: &mut client::TestClient,
    timeout: Duration,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    tokio::time::timeout(timeout, async {
        loop {
            match client.next_event().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
