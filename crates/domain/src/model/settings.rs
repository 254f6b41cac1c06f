use chrono::NaiveTime;

pub const SETTING_AUTO_CHECK_INTERVAL: &str = "auto_check_interval_minutes";
pub const SETTING_GLOBAL_VERIFY_MODE: &str = "global_verify_mode";
pub const SETTING_EXPIRY_NOTIFICATION_TIME: &str = "expiry_notification_time";

pub const DEFAULT_CHECK_INTERVAL_MINUTES: u32 = 5;
pub const MIN_CHECK_INTERVAL_MINUTES: u32 = 1;
pub const MAX_CHECK_INTERVAL_MINUTES: u32 = 1440;
pub const DEFAULT_EXPIRY_NOTIFICATION_TIME: &str = "10:00";

pub fn clamp_interval(minutes: u32) -> u32 {
    minutes.clamp(MIN_CHECK_INTERVAL_MINUTES, MAX_CHECK_INTERVAL_MINUTES)
}

/// Parses an `HH:MM` wall-clock time.
pub fn parse_notification_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

pub fn default_notification_time() -> NaiveTime {
    NaiveTime::from_hms_opt(10, 0, 0).unwrap_or(NaiveTime::MIN)
}
