use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Which plugin pipelines to bypass on write operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BypassPlugins {
    #[default]
    None,
    Sync,
    Async,
    All,
}

/// Per-call options forwarded to the platform as request headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub bypass_plugins: BypassPlugins,
    pub bypass_flows: bool,
    /// Ask the server to keep processing a bulk payload past row failures and
    /// report them per index instead of failing the whole call.
    pub continue_on_error: bool,
}

impl CallOptions {
    pub fn new() -> Self {
        CallOptions::default()
    }

    pub fn with_bypass_plugins(mut self, bypass: BypassPlugins) -> Self {
        self.bypass_plugins = bypass;
        self
    }

    pub fn with_bypass_flows(mut self, bypass: bool) -> Self {
        self.bypass_flows = bypass;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_parse() {
        assert_eq!("all".parse::<BypassPlugins>().unwrap(), BypassPlugins::All);
        assert_eq!("none".parse::<BypassPlugins>().unwrap(), BypassPlugins::None);
        assert!("everything".parse::<BypassPlugins>().is_err());
    }
}
