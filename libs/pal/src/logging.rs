// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Debug channel setup. A channel is a `tracing` target, i.e. the module path of the code that
//! emits the event.

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use crate::config::LogConfig;

/// Builds the filter for `config`: the global level plus one directive per channel.
///
/// # Errors
///
/// Returns an error if a channel directive can't be parsed.
pub fn env_filter(config: &LogConfig) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .parse("")
        .context("failed to build log filter")?;

    for channel in &config.channels {
        let directive: Directive = channel
            .parse()
            .with_context(|| format!("invalid log channel directive {channel:?}"))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// Installs the global `fmt` subscriber.
///
/// Returns `false` if a global subscriber was already installed, in which case the existing one
/// stays in place.
///
/// # Errors
///
/// Returns an error if the filter can't be built from `config`.
pub fn init(config: &LogConfig) -> anyhow::Result<bool> {
    let filter = env_filter(config)?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn channel_directives() {
        let config = LogConfig {
            level: LogLevel::Warn,
            channels: vec![String::from("critsect=trace"), String::from("shmem=debug")],
        };
        let filter = env_filter(&config).unwrap().to_string();
        assert!(filter.contains("critsect=trace"));
        assert!(filter.contains("shmem=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn invalid_directive() {
        let config = LogConfig {
            level: LogLevel::Info,
            channels: vec![String::from("critsect=loud")],
        };
        let err = env_filter(&config).unwrap_err();
        assert!(err.to_string().contains("critsect=loud"));
    }

    #[test]
    fn second_install_is_ignored() {
        let config = LogConfig::default();
        // another test in this binary may have installed it first
        let _ = init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }
}
