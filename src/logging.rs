use std::fs;

use anyhow::Context;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;

use crate::config::AppConfig;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}";

/// Build the log4rs configuration: a file appender always, plus a stderr
/// console appender when enabled. stdout belongs to the UI.
pub fn build_config(config: &AppConfig) -> anyhow::Result<Config> {
    if let Some(parent) = config.log_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir: {}", parent.display()))?;
    }

    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(&config.log_file)
        .with_context(|| format!("open log file: {}", config.log_file.display()))?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if config.log_console {
        let console = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    // rusqlite and which are chatty at debug
    let builder = builder
        .logger(Logger::builder().build("rusqlite", log::LevelFilter::Warn))
        .logger(Logger::builder().build("which", log::LevelFilter::Warn));

    builder
        .build(root.build(config.log_level))
        .context("invalid logging configuration")
}

/// Install the global logger. Call once, before anything logs.
pub fn init(config: &AppConfig) -> anyhow::Result<Handle> {
    let handle = log4rs::init_config(build_config(config)?).context("install logger")?;

    for warning in &config.warnings {
        log::warn!("{}", warning);
    }
    log::info!(
        "Logging at {} to {}{}",
        config.log_level,
        config.log_file.display(),
        if config.log_console { " and console" } else { "" }
    );
    Ok(handle)
}
