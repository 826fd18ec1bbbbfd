use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Initialize the process-wide logging sink.
///
/// Components receive no logger handle; they log through the `tracing`
/// macros and everything funnels into the subscriber installed here.
/// `RUST_LOG` overrides the default level when set.
pub fn init(default_level: LevelFilter) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
