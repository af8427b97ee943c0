use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize structured logging for the whole process.
pub(crate) fn init(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
