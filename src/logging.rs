use std::io::Write;
use std::sync::Once;

use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the `env_logger` backend. `RUST_LOG` wins over `level`; later
/// calls are no-ops.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let mut builder = Builder::from_env(Env::default().default_filter_or(level.as_str()));
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
        // Someone else installed a logger first; keep theirs.
        if builder.try_init().is_err() {
            log::debug!("Logger already initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LevelFilter::Debug);
        init(LevelFilter::Info);
        log::info!("still logging");
    }
}
