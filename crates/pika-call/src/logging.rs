/// Installs a `tracing_subscriber::fmt` subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` when set, otherwise `pika_call=debug,info`.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pika_call=debug,info".into()),
        )
        .with_target(true)
        .try_init();
}
