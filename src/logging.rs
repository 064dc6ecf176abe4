// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tracing subscriber setup.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn filter(settings: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(settings: &LoggingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(settings))
        .with(fmt::layer().with_ansi(settings.ansi))
        .try_init()?;

    tracing::debug!("Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_falls_back() {
        let settings = LoggingConfig {
            level: "not a [valid directive".to_string(),
            ansi: false,
        };
        // RUST_LOG may be set in CI; either way a filter is produced
        let _ = filter(&settings);
    }

    #[test]
    fn test_second_init_fails() {
        let settings = LoggingConfig::default();
        let _ = init(&settings);
        assert!(init(&settings).is_err());
    }
}
