pub const ADAPTER: &str = "adapter";
pub const BRIDGE: &str = "bridge";
pub const BACKOFF: &str = "backoff";
pub const LIMITER: &str = "limiter";
pub const POLLING: &str = "polling";
pub const DISPATCH: &str = "dispatch";
pub const STORAGE: &str = "storage";
pub const CLI: &str = "cli";

pub const ALL: [&str; 8] = [ADAPTER, BRIDGE, BACKOFF, LIMITER, POLLING, DISPATCH, STORAGE, CLI];
