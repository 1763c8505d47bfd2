use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Coarse verbosity ladder for embedders that do not want to write filter
/// directives themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogVerbosity {
    Silent,
    Errors,
    #[default]
    Warnings,
    Info,
    Debug,
    Everything,
}

impl LogVerbosity {
    pub fn directive(self) -> &'static str {
        match self {
            LogVerbosity::Silent => "off",
            LogVerbosity::Errors => "error",
            LogVerbosity::Warnings => "warn",
            LogVerbosity::Info => "info",
            LogVerbosity::Debug => "debug",
            LogVerbosity::Everything => "trace",
        }
    }

    /// `RUST_LOG` wins over the ladder when set.
    pub fn filter(self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive()))
    }
}

/// Installs a global fmt subscriber. Returns `false` if one was already set.
pub fn init(verbosity: LogVerbosity) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(verbosity.filter())
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_maps_onto_filter_directives() {
        assert_eq!(LogVerbosity::Silent.directive(), "off");
        assert_eq!(LogVerbosity::Everything.directive(), "trace");
        assert!(LogVerbosity::Debug > LogVerbosity::Warnings);
        assert_eq!(LogVerbosity::default(), LogVerbosity::Warnings);
    }

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init(LogVerbosity::Errors);
        assert!(!init(LogVerbosity::Debug));
    }
}
