use std::future::Future;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime};
use log::{error, info};

use crate::selection::Slot;

/// Parse "HH:MM" post times, one per slot.
pub fn parse_post_times(raw: &[String]) -> Result<Vec<NaiveTime>> {
    if raw.is_empty() {
        bail!("No post times configured");
    }
    raw.iter()
        .take(Slot::ALL.len())
        .map(|t| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .with_context(|| format!("Invalid post time {t:?}, expected HH:MM"))
        })
        .collect()
}

/// The slot whose post time comes next after `now`, and when it fires.
pub fn next_slot(now: DateTime<FixedOffset>, times: &[NaiveTime]) -> Option<(Slot, DateTime<FixedOffset>)> {
    let offset = now.timezone();
    times
        .iter()
        .zip(Slot::ALL)
        .filter_map(|(time, slot)| {
            let today = now.date_naive().and_time(*time).and_local_timezone(offset).single()?;
            let at = if today > now { today } else { today + Duration::days(1) };
            Some((slot, at))
        })
        .min_by_key(|(_, at)| *at)
}

/// Sleep until each post time and run its slot. Failures are logged and the
/// loop carries on; Ctrl-C ends it.
pub async fn run_schedule<N, F, Fut>(times: &[NaiveTime], now: N, mut job: F) -> Result<()>
where
    N: Fn() -> DateTime<FixedOffset>,
    F: FnMut(Slot) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let current = now();
        let (slot, at) = next_slot(current, times).ok_or_else(|| anyhow!("No usable post time"))?;
        let wait = (at - current).to_std().unwrap_or_default();
        info!("Next run: slot {} at {} (in {}s)", slot.index(), at.format("%Y-%m-%d %H:%M"), wait.as_secs());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping scheduler");
                return Ok(());
            }
        }

        match job(slot).await {
            Ok(()) => info!("Slot {} finished", slot.index()),
            Err(e) => error!("Slot {} failed: {:#}", slot.index(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 10, h, m, 0)
            .unwrap()
    }

    fn times() -> Vec<NaiveTime> {
        parse_post_times(&["10:00".to_string(), "18:00".to_string()]).unwrap()
    }

    #[test]
    fn test_parse_post_times() {
        assert_eq!(times()[1], NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert!(parse_post_times(&["25:00".to_string()]).is_err());
        assert!(parse_post_times(&[]).is_err());
    }

    #[test]
    fn test_next_slot_same_day() {
        assert_eq!(next_slot(at(8, 0), &times()), Some((Slot::First, at(10, 0))));
        assert_eq!(next_slot(at(12, 30), &times()), Some((Slot::Second, at(18, 0))));
    }

    #[test]
    fn test_next_slot_rolls_over() {
        let (slot, when) = next_slot(at(18, 0), &times()).unwrap();
        assert_eq!(slot, Slot::First);
        assert_eq!(when, at(10, 0) + Duration::days(1));
    }

    #[test]
    fn test_next_slot_empty() {
        assert_eq!(next_slot(at(8, 0), &[]), None);
    }
}
