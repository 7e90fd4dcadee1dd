/// Process-wide connection limits. `outgoing_limit` is the default and may be
///  overridden by the argument to `start`.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub outgoing_limit: usize,
    pub incoming_limit: usize,
    pub bind_limit: usize,
    pub total_limit: usize,
}

impl HandlerConfig {
    pub fn new() -> HandlerConfig {
        HandlerConfig {
            outgoing_limit: 8,
            incoming_limit: 125,
            bind_limit: 8,
            total_limit: 133,
        }
    }
}

impl Default for HandlerConfig {
    fn default() -> HandlerConfig {
        HandlerConfig::new()
    }
}
