use std::time::Duration;

/// Hub tuning knobs. Distinct from `rt_store::Config` (which only covers
/// storage locators and GC period) so the hub doesn't need to know about
/// DSNs.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Delay between authing a named connection and broadcasting its `join`
    /// event, giving the client time to finish subscribing first.
    pub join_delay: Duration,
    pub verbose: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig { join_delay: Duration::from_secs(3), verbose: false }
    }
}
