//! Helpers shared by the unit tests.
use std::convert::Infallible;
use std::sync::Once;

use futures::StreamExt;
use futures::channel::mpsc;

/// In-memory transport made from a channel pair; the stream/sink tuple impl
/// of the transport trait makes it usable anywhere a real connection is.
pub type TestTransport = (
    futures::stream::Map<mpsc::Receiver<String>, fn(String) -> Result<String, Infallible>>,
    mpsc::Sender<String>,
);

fn ok_frame(frame: String) -> Result<String, Infallible> {
    Ok(frame)
}

/// Two connected in-memory transports: frames sent on one side arrive on the
/// other.
pub fn setup_test_channel() -> (TestTransport, TestTransport) {
    let (near_tx, far_rx) = mpsc::channel(32);
    let (far_tx, near_rx) = mpsc::channel(32);

    let map = ok_frame as fn(String) -> Result<String, Infallible>;
    ((near_rx.map(map), near_tx), (far_rx.map(map), far_tx))
}

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging output.  Idempotent so every test can call it
/// first thing.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
