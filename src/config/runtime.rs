use super::EngineConfig;

impl EngineConfig {
    /// Applies `TETHER_*` environment overrides on top of file/default values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup; unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TETHER_CHECK_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.scheduler.check_interval_secs = n;
            }
        }
        if let Some(v) = lookup("TETHER_REFRESH_THRESHOLD_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.scheduler.refresh_threshold_secs = n;
            }
        }
        if let Some(v) = lookup("TETHER_REFRESH_ERROR_WEBHOOK") {
            if !v.is_empty() {
                self.scheduler.failure_webhook_url = Some(v);
            }
        }
        if let Some(v) = lookup("TETHER_ERROR_TRACKING_ENDPOINT") {
            if !v.is_empty() {
                self.errors.tracking_endpoint = Some(v);
            }
        }
        if let Some(v) = lookup("TETHER_DATABASE") {
            if !v.is_empty() {
                self.storage.database_path = v;
            }
        }
    }
}
