use std::error::Error;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::configure::AppConfig;

const LOG_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}{n}";

fn pattern() -> Box<PatternEncoder> {
    Box::new(PatternEncoder::new(LOG_PATTERN))
}

/// Console logging, plus a file appender when `log_to_file` is set.
/// Unrecognised `log_level` values fall back to info.
pub fn setup_logger(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let level = config.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

    let console = ConsoleAppender::builder().encoder(pattern()).build();
    let mut appenders = vec![Appender::builder().build("console", Box::new(console))];

    if config.log_to_file {
        let logfile = FileAppender::builder().encoder(pattern()).build(&config.log_file)?;
        appenders.push(Appender::builder().build("logfile", Box::new(logfile)));
    }

    let root = appenders
        .iter()
        .fold(Root::builder(), |root, appender| root.appender(appender.name()))
        .build(level);

    log4rs::init_config(Config::builder().appenders(appenders).build(root)?)?;
    Ok(())
}
