use log::info;
use std::{io::Write, sync::Once};

/// One megabyte in bytes.
pub const ONE_MB: usize = 1024 * 1024;

/// Init log. Set log format.
pub fn init_log() {
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}:{} - {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();
}

static INIT_LOG: Once = Once::new();

/// Setup.
pub fn setup_log() {
    INIT_LOG.call_once(|| {
        init_log();
    });
}

#[macro_export]
macro_rules! error_bail {
    ($msg:literal $(,)?) => {
        log::error!($msg);
        anyhow::bail!($msg)
    };
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        anyhow::bail!($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        log::error!($fmt, $($arg)*);
        anyhow::bail!($fmt, $($arg)*)
    };
}

/// Convert bytes to megabytes, rounding up, so a non-empty cache never reports `0`.
#[inline]
pub fn bytes_to_mb(bytes: usize) -> usize {
    (bytes + ONE_MB - 1) / ONE_MB
}

/// Elapsed milliseconds since `start`, measured with the coarse clock.
#[inline]
pub fn elapsed_millis(start: coarsetime::Instant) -> u64 {
    start.elapsed().as_millis()
}

/// Log a named phase together with the time it took.
pub fn log_phase_done(phase: &str, start: coarsetime::Instant) {
    info!("{} done, takes {} ms", phase, elapsed_millis(start));
}
