//! Tracing setup and replay-aware logging macros for orchestration code.

/// Install the global `tracing` subscriber: `RUST_LOG` filter, default `info`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// `tracing::info!` that stays silent while the orchestration is replaying.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(target: "duratask::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(target: "duratask::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(target: "duratask::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
