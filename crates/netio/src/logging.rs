//! Process-wide logging setup.
//!
//! Logs go to stderr; stdout belongs to the relayed command output.

use std::backtrace::Backtrace;

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Route panics through tracing with a captured backtrace, then run the
/// default hook.
///
/// Connection tasks are isolated from each other by the runtime, so this is
/// where the stack of a crashed session ends up.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = Backtrace::force_capture();
        let thread = std::thread::current();
        tracing::error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            "panic: {}\n{}",
            panic_info,
            backtrace
        );
        default_hook(panic_info);
    }));
}
