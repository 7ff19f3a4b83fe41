//! Wait step configurations and resume-time computation

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::criteria::FieldCriterion;
use crate::model::WaitType;

/// How a wait step resumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "wait_type", rename_all = "snake_case")]
pub enum WaitConfig {
    /// Fixed duration from step entry
    FixedTime { duration_seconds: u64 },

    /// Absolute instant; the offset in the timestamp is honoured
    UntilDate { until: DateTime<FixedOffset> },

    /// Next occurrence of a local time of day
    ///
    /// The offset falls back to the contact's offset, then UTC.
    UntilTime {
        time: NaiveTime,
        #[serde(default)]
        utc_offset_minutes: Option<i32>,
        #[serde(default)]
        days_of_week: Vec<Weekday>,
    },

    /// Until a correlated event arrives, or the timeout elapses
    ForEvent {
        event_type: String,
        #[serde(default)]
        match_criteria: Vec<FieldCriterion>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        /// Execution metadata key holding the correlation id
        #[serde(default)]
        correlation_key: Option<String>,
    },
}

const MAX_OFFSET_MINUTES: i32 = 14 * 60;

impl WaitConfig {
    pub fn wait_type(&self) -> WaitType {
        match self {
            WaitConfig::FixedTime { .. } => WaitType::FixedTime,
            WaitConfig::UntilDate { .. } => WaitType::UntilDate,
            WaitConfig::UntilTime { .. } => WaitType::UntilTime,
            WaitConfig::ForEvent { .. } => WaitType::ForEvent,
        }
    }

    pub fn is_event_based(&self) -> bool {
        matches!(self, WaitConfig::ForEvent { .. })
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            WaitConfig::FixedTime { duration_seconds } => {
                if *duration_seconds == 0 {
                    Err("fixed wait needs a positive duration".to_string())
                } else {
                    Ok(())
                }
            }
            WaitConfig::UntilDate { .. } => Ok(()),
            WaitConfig::UntilTime {
                utc_offset_minutes, ..
            } => match utc_offset_minutes {
                Some(m) if m.abs() > MAX_OFFSET_MINUTES => {
                    Err(format!("utc offset {} minutes is out of range", m))
                }
                _ => Ok(()),
            },
            WaitConfig::ForEvent {
                event_type,
                match_criteria,
                timeout_seconds,
                ..
            } => {
                if event_type.trim().is_empty() {
                    return Err("event wait needs an event_type".to_string());
                }
                if *timeout_seconds == Some(0) {
                    return Err("event wait timeout must be positive".to_string());
                }
                match_criteria.iter().try_for_each(FieldCriterion::validate)
            }
        }
    }

    /// When a time-based wait entered at `entered_at` resumes
    ///
    /// Returns the listener expiry for event waits (`None` = no timeout).
    pub fn resume_at(
        &self,
        entered_at: DateTime<Utc>,
        contact_offset_minutes: Option<i32>,
    ) -> Option<DateTime<Utc>> {
        match self {
            WaitConfig::FixedTime { duration_seconds } => {
                Some(entered_at + chrono::Duration::seconds(*duration_seconds as i64))
            }
            WaitConfig::UntilDate { until } => Some(until.with_timezone(&Utc).max(entered_at)),
            WaitConfig::UntilTime {
                time,
                utc_offset_minutes,
                days_of_week,
            } => next_local_time(
                entered_at,
                *time,
                utc_offset_minutes.or(contact_offset_minutes).unwrap_or(0),
                days_of_week,
            ),
            WaitConfig::ForEvent {
                timeout_seconds, ..
            } => timeout_seconds.map(|s| entered_at + chrono::Duration::seconds(s as i64)),
        }
    }
}

fn next_local_time(
    after: DateTime<Utc>,
    time: NaiveTime,
    offset_minutes: i32,
    days_of_week: &[Weekday],
) -> Option<DateTime<Utc>> {
    let offset = FixedOffset::east_opt(offset_minutes.clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES) * 60)?;
    let local_now = after.with_timezone(&offset);
    let today = local_now.date_naive();

    (0..=7)
        .map(|days| today + chrono::Duration::days(days))
        .filter(|date| days_of_week.is_empty() || days_of_week.contains(&date.weekday()))
        .filter_map(|date| date.and_time(time).and_local_timezone(offset).single())
        .find(|candidate| *candidate > local_now)
        .map(|candidate| candidate.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_fixed_time() {
        let wait = WaitConfig::FixedTime {
            duration_seconds: 60,
        };
        let entered = at(2024, 5, 1, 12, 0);
        assert_eq!(wait.resume_at(entered, None), Some(at(2024, 5, 1, 12, 1)));
    }

    #[test]
    fn test_until_date_honours_offset() {
        let wait: WaitConfig = serde_json::from_value(json!({
            "wait_type": "until_date",
            "until": "2024-06-01T09:00:00+02:00"
        }))
        .unwrap();

        assert_eq!(
            wait.resume_at(at(2024, 5, 1, 0, 0), None),
            Some(at(2024, 6, 1, 7, 0))
        );
    }

    #[test]
    fn test_until_date_in_past_resumes_immediately() {
        let wait: WaitConfig = serde_json::from_value(json!({
            "wait_type": "until_date",
            "until": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        let entered = at(2024, 5, 1, 0, 0);

        assert_eq!(wait.resume_at(entered, None), Some(entered));
    }

    #[test]
    fn test_until_time_later_today() {
        let wait = WaitConfig::UntilTime {
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            utc_offset_minutes: Some(-300),
            days_of_week: vec![],
        };

        // 12:00 UTC is 07:00 at UTC-5, so 09:00 local is 14:00 UTC the same day
        assert_eq!(
            wait.resume_at(at(2024, 5, 1, 12, 0), None),
            Some(at(2024, 5, 1, 14, 0))
        );
    }

    #[test]
    fn test_until_time_rolls_to_next_day() {
        let wait = WaitConfig::UntilTime {
            time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            utc_offset_minutes: None,
            days_of_week: vec![],
        };

        assert_eq!(
            wait.resume_at(at(2024, 5, 1, 10, 0), None),
            Some(at(2024, 5, 2, 9, 0))
        );
    }

    #[test]
    fn test_until_time_uses_contact_offset_and_weekdays() {
        let wait = WaitConfig::UntilTime {
            time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            utc_offset_minutes: None,
            days_of_week: vec![Weekday::Mon],
        };

        // 2024-05-01 is a Wednesday; next Monday is 2024-05-06, 08:00 at UTC+1
        assert_eq!(
            wait.resume_at(at(2024, 5, 1, 10, 0), Some(60)),
            Some(at(2024, 5, 6, 7, 0))
        );
    }

    #[test]
    fn test_event_wait_timeout() {
        let wait = WaitConfig::ForEvent {
            event_type: "email_opened".into(),
            match_criteria: vec![],
            timeout_seconds: Some(3600),
            correlation_key: None,
        };
        let entered = at(2024, 5, 1, 10, 0);

        assert!(wait.is_event_based());
        assert_eq!(wait.resume_at(entered, None), Some(at(2024, 5, 1, 11, 0)));
    }

    #[test]
    fn test_validate() {
        assert!(WaitConfig::FixedTime {
            duration_seconds: 0
        }
        .validate()
        .is_err());
        assert!(WaitConfig::ForEvent {
            event_type: "".into(),
            match_criteria: vec![],
            timeout_seconds: None,
            correlation_key: None,
        }
        .validate()
        .is_err());
    }
}
