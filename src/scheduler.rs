use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, NaiveTime};

/// Parses a `HH:MM` wall-clock time from the config file.
pub fn parse_run_time(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .with_context(|| format!("invalid scheduler time '{input}', expected HH:MM"))
}

/// Time until the next occurrence of `at`, today or tomorrow.
fn delay_until(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut target = now.date().and_time(at);
    if target <= now {
        target += chrono::Duration::days(1);
    }
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Runs `job` once a day at the configured local time until it reports that
/// the run was interrupted.
pub async fn run_daily<F, Fut>(time_str: &str, mut job: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let at = parse_run_time(time_str)?;
    log::info!("scheduler active, daily run at {at} local time");

    loop {
        let delay = delay_until(chrono::Local::now().naive_local(), at);
        log::info!(
            "next run in {:.1} hour(s)",
            delay.as_secs_f64() / 3600.0
        );
        tokio::time::sleep(delay).await;

        let interrupted = job().await?;
        if interrupted {
            log::info!("scheduler stopping after interrupted run");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_run_time() {
        assert_eq!(
            parse_run_time("20:00").unwrap(),
            NaiveTime::from_hms_opt(20, 0, 0).unwrap()
        );
        assert_eq!(
            parse_run_time(" 06:30 ").unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        assert!(parse_run_time("25:00").is_err());
        assert!(parse_run_time("evening").is_err());
    }

    #[test]
    fn test_delay_until_later_today() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let at = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        assert_eq!(delay_until(now, at), Duration::from_secs(10 * 3600));
    }

    #[test]
    fn test_delay_until_rolls_to_tomorrow() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(21, 0, 0)
            .unwrap();
        let at = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        assert_eq!(delay_until(now, at), Duration::from_secs(23 * 3600));
    }
}
