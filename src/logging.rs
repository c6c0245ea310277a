//! Diagnostic logging (ambient; SPEC_FULL §4.7). Distinct from the
//! structured transaction log of `event_log`; this is unstructured
//! operator-facing output with no schema contract.
//!
//! Ground: `rproxy::init::logger::init` (`fern::Dispatch` + `chrono`
//! timestamping + optional ANSI coloring), extended to also write a
//! diagnostic file sink alongside stdout.

use std::str::FromStr;

use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};

const DIAGNOSTIC_LOG_FILE: &str = "proxy.diag.log";

pub fn init(log_level: &str, colored: bool) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .trace(Color::Magenta)
        .debug(Color::Blue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().to_rfc3339(),
                if colored {
                    colors.color(record.level()).to_string()
                } else {
                    record.level().to_string()
                },
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::from_str(log_level)?)
        .chain(std::io::stdout())
        .chain(fern::log_file(DIAGNOSTIC_LOG_FILE)?)
        .apply()?;
    Ok(())
}
