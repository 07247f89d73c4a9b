//! Logging helpers for the quicksilver workspace.
//!
//! The ORM core only ever talks to the `log` facade; tests and demos call
//! [log_to_stderr] once at startup to get a sink.

/// Log to stderr.
///
/// If called multiple times in the same process, only applies once.  The
/// filter defaults to `info` for everything and `debug` for the ORM itself,
/// and can still be overridden through `RUST_LOG`.
pub fn log_to_stderr() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .filter_module("quicksilver", log::LevelFilter::Debug)
            .parse_default_env()
            .format(|buf, record| {
                use std::io::Write;

                let now = time::OffsetDateTime::now_utc();

                writeln!(
                    buf,
                    "{} {} time={} target={}",
                    record.level(),
                    record.args(),
                    now,
                    record.target()
                )
            })
            .init();
    });
}
