//! Logging setup for the renderer
//!
//! The engine logs routine emission at `debug` and per-draw/batch
//! bookkeeping at `trace`; left unfiltered those flood any binary that
//! submits real frame loads. These initializers scope the default filter to
//! the engine's own targets — `RUST_LOG` still overrides everything.

/// Initialize logging with the engine quieted to `info` by default
pub fn init() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,raster_engine=info"),
    )
    .init();
}

/// Initialize verbose logging for debugging code generation and draw
/// scheduling: `debug` for the engine, `trace` for the JIT layer so every
/// emitted routine and batch barrier is visible.
pub fn init_verbose() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        "info,raster_engine=debug,raster_engine::reactor=trace,raster_engine::device=trace",
    ))
    .init();
}
