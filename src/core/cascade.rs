//! Configuration cascade: global defaults, then device, then share.
//!
//! Every field resolves on its own, so a share may override only its exclude
//! list while inheriting the device's schedule. Pattern lists are replaced at
//! the most specific level that sets them, never merged.

use serde::Serialize;

use crate::core::cron::{self, CronExpr};
use crate::core::error::JobError;
use crate::core::models::{
    Device, GlobalConfig, Overrides, RetentionOverride, RetentionPolicy, Schedule, Share,
};

/// Used when no level sets a retention count.
pub const DEFAULT_RETENTION: RetentionPolicy = RetentionPolicy {
    keep_latest: 3,
    keep_daily: 7,
    keep_weekly: 4,
    keep_monthly: 6,
    keep_yearly: 1,
};

/// Used when no level sets a schedule.
pub const DEFAULT_SCHEDULE: Schedule = Schedule::Disabled;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternRules {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PatternRules {
    /// Rejects empty patterns and patterns that are both included and excluded.
    pub fn validate(&self) -> Result<(), JobError> {
        if self
            .include
            .iter()
            .chain(self.exclude.iter())
            .any(|p| p.trim().is_empty())
        {
            return Err(JobError::Configuration("empty include/exclude pattern".to_string()));
        }
        if let Some(pattern) = self.include.iter().find(|p| self.exclude.contains(p)) {
            return Err(JobError::Configuration(format!(
                "pattern '{}' is both included and excluded",
                pattern
            )));
        }
        Ok(())
    }
}

/// Resolved settings for one backup target. Never cached across resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub schedule: Schedule,
    pub retention: RetentionPolicy,
    pub rules: PatternRules,
}

impl EffectiveConfig {
    /// Compiled schedule, or `None` when scheduling is disabled.
    pub fn cron(&self) -> Result<Option<CronExpr>, JobError> {
        match &self.schedule {
            Schedule::Disabled => Ok(None),
            Schedule::Cron(expr) => cron::compile(expr)
                .map(Some)
                .map_err(|e| JobError::Configuration(format!("schedule '{}': {}", expr, e))),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        self.cron()?;
        self.rules.validate()
    }
}

/// First level (most specific first) that sets the field.
fn most_specific<'a, T: ?Sized>(levels: [Option<&'a T>; 3]) -> Option<&'a T> {
    levels.into_iter().flatten().next()
}

/// Resolve the effective configuration for a share (or for the device as a
/// whole when `share` is `None`). Pure and total.
pub fn resolve(global: &GlobalConfig, device: &Device, share: Option<&Share>) -> EffectiveConfig {
    let levels: [Option<&Overrides>; 3] = [
        share.map(|s| &s.overrides),
        Some(&device.overrides),
        Some(&global.overrides),
    ];

    let schedule = most_specific(levels.map(|o| o.and_then(|o| o.schedule.as_ref())))
        .cloned()
        .unwrap_or(DEFAULT_SCHEDULE);

    let count = |pick: fn(&RetentionOverride) -> Option<u32>, default: u32| -> u32 {
        levels
            .iter()
            .flatten()
            .find_map(|o| pick(&o.retention))
            .unwrap_or(default)
    };
    let retention = RetentionPolicy {
        keep_latest: count(|r| r.keep_latest, DEFAULT_RETENTION.keep_latest),
        keep_daily: count(|r| r.keep_daily, DEFAULT_RETENTION.keep_daily),
        keep_weekly: count(|r| r.keep_weekly, DEFAULT_RETENTION.keep_weekly),
        keep_monthly: count(|r| r.keep_monthly, DEFAULT_RETENTION.keep_monthly),
        keep_yearly: count(|r| r.keep_yearly, DEFAULT_RETENTION.keep_yearly),
    };

    let rules = PatternRules {
        include: most_specific(levels.map(|o| o.and_then(|o| o.include.as_deref())))
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
        exclude: most_specific(levels.map(|o| o.and_then(|o| o.exclude.as_deref())))
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
    };

    EffectiveConfig {
        schedule,
        retention,
        rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Protocol;

    fn cron(expr: &str) -> Option<Schedule> {
        Some(Schedule::Cron(expr.to_string()))
    }

    fn fixtures() -> (GlobalConfig, Device, Share) {
        (
            GlobalConfig::default(),
            Device::new("nas", Protocol::Smb, "10.0.0.2"),
            Share::new("docs", "/docs"),
        )
    }

    #[test]
    fn empty_cascade_falls_back_to_system_defaults() {
        let (global, device, share) = fixtures();
        let effective = resolve(&global, &device, Some(&share));
        assert_eq!(effective.schedule, DEFAULT_SCHEDULE);
        assert_eq!(effective.retention, DEFAULT_RETENTION);
        assert!(effective.rules.include.is_empty());
        assert!(effective.rules.exclude.is_empty());
    }

    #[test]
    fn schedule_precedence() {
        let (mut global, mut device, mut share) = fixtures();
        global.overrides.schedule = cron("0 1 * * *");
        assert_eq!(
            resolve(&global, &device, Some(&share)).schedule,
            Schedule::Cron("0 1 * * *".into())
        );

        device.overrides.schedule = cron("0 2 * * *");
        assert_eq!(
            resolve(&global, &device, Some(&share)).schedule,
            Schedule::Cron("0 2 * * *".into())
        );

        share.overrides.schedule = Some(Schedule::Disabled);
        assert_eq!(
            resolve(&global, &device, Some(&share)).schedule,
            Schedule::Disabled
        );
        // device-level resolution ignores shares entirely
        assert_eq!(
            resolve(&global, &device, None).schedule,
            Schedule::Cron("0 2 * * *".into())
        );
    }

    #[test]
    fn retention_counts_resolve_independently() {
        let (mut global, mut device, mut share) = fixtures();
        global.overrides.retention.keep_daily = Some(10);
        global.overrides.retention.keep_weekly = Some(10);
        device.overrides.retention.keep_weekly = Some(20);
        device.overrides.retention.keep_monthly = Some(20);
        share.overrides.retention.keep_monthly = Some(30);

        let retention = resolve(&global, &device, Some(&share)).retention;
        assert_eq!(retention.keep_latest, DEFAULT_RETENTION.keep_latest);
        assert_eq!(retention.keep_daily, 10);
        assert_eq!(retention.keep_weekly, 20);
        assert_eq!(retention.keep_monthly, 30);
        assert_eq!(retention.keep_yearly, DEFAULT_RETENTION.keep_yearly);
    }

    #[test]
    fn share_patterns_replace_device_patterns() {
        let (mut global, mut device, mut share) = fixtures();
        global.overrides.include = Some(vec!["global/**".into()]);
        device.overrides.exclude = Some(vec!["*.tmp".into(), "cache/".into()]);
        share.overrides.exclude = Some(vec!["*.iso".into()]);

        let rules = resolve(&global, &device, Some(&share)).rules;
        assert_eq!(rules.exclude, vec!["*.iso".to_string()]);
        // include is not set below global, so global wins for that field
        assert_eq!(rules.include, vec!["global/**".to_string()]);
    }

    #[test]
    fn empty_share_list_still_overrides() {
        let (global, mut device, mut share) = fixtures();
        device.overrides.exclude = Some(vec!["*.tmp".into()]);
        share.overrides.exclude = Some(Vec::new());

        let rules = resolve(&global, &device, Some(&share)).rules;
        assert!(rules.exclude.is_empty());
    }

    #[test]
    fn partial_share_override_keeps_inherited_schedule() {
        let (global, mut device, mut share) = fixtures();
        device.overrides.schedule = cron("0 4 * * *");
        share.overrides.exclude = Some(vec!["*.bak".into()]);

        let effective = resolve(&global, &device, Some(&share));
        assert_eq!(effective.schedule, Schedule::Cron("0 4 * * *".into()));
        assert_eq!(effective.rules.exclude, vec!["*.bak".to_string()]);
    }

    #[test]
    fn validation_flags_conflicts_and_bad_cron() {
        let (global, mut device, share) = fixtures();
        device.overrides.include = Some(vec!["photos/".into()]);
        device.overrides.exclude = Some(vec!["photos/".into()]);
        assert!(matches!(
            resolve(&global, &device, Some(&share)).validate(),
            Err(JobError::Configuration(_))
        ));

        let (global, mut device, share) = fixtures();
        device.overrides.schedule = cron("0 2 1 * MON");
        assert!(matches!(
            resolve(&global, &device, Some(&share)).validate(),
            Err(JobError::Configuration(_))
        ));
    }
}
