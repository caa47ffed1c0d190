//! Periodic maintenance: client reminders and expiry of stale bookings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::domain::booking::business_now;
use crate::models::{AppointmentDetailRow, APPOINTMENT_DETAIL_SELECT};
use crate::notifications::{Delivery, NotificationService};

/// Refresh tokens are kept this long past expiry before they are purged.
pub const REFRESH_TOKEN_RETENTION_DAYS: i32 = 7;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReminderRun {
    pub due: usize,
    pub stamped: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupRun {
    pub expired_appointments: u64,
    pub purged_tokens: u64,
}

/// Whether a reminder counts as done. With nothing to try (no contact data or
/// no gateway) it is settled too; only failed attempts are retried next tick.
pub fn reminder_settled(delivery: Delivery) -> bool {
    delivery.attempted == 0 || delivery.delivered > 0
}

pub fn reminder_date(today: NaiveDate) -> Option<NaiveDate> {
    today.checked_add_days(Days::new(1))
}

pub async fn run_reminders(
    db: &sqlx::PgPool,
    config: &Config,
    notifier: &NotificationService,
) -> Result<ReminderRun, sqlx::Error> {
    let today = business_now(config.business_offset()).date();
    let Some(tomorrow) = reminder_date(today) else {
        return Ok(ReminderRun::default());
    };

    let due = sqlx::query_as::<_, AppointmentDetailRow>(&format!(
        r#"{APPOINTMENT_DETAIL_SELECT}
        WHERE a.scheduled_date = $1
          AND a.status = 0
          AND a.is_deleted = false
          AND a.reminder_sent_at IS NULL
        ORDER BY a.scheduled_time ASC
        "#
    ))
    .bind(tomorrow)
    .fetch_all(db)
    .await?;

    let mut run = ReminderRun {
        due: due.len(),
        stamped: 0,
    };

    for appt in &due {
        let delivery = notifier.send_reminder(appt).await;
        if !reminder_settled(delivery) {
            continue;
        }
        sqlx::query(
            r#"
            UPDATE appointment
            SET reminder_sent_at = now(), updated_at = now()
            WHERE appointment_id = $1
            "#,
        )
        .bind(appt.appointment_id)
        .execute(db)
        .await?;
        run.stamped += 1;
    }
    Ok(run)
}

pub async fn run_cleanup(db: &sqlx::PgPool, config: &Config) -> Result<CleanupRun, sqlx::Error> {
    let today = business_now(config.business_offset()).date();

    let expired = sqlx::query(
        r#"
        UPDATE appointment
        SET status = 3, updated_at = now()
        WHERE status = 0
          AND is_deleted = false
          AND scheduled_date < $1
        "#,
    )
    .bind(today)
    .execute(db)
    .await?;

    let purged = sqlx::query(
        r#"
        DELETE FROM refresh_token
        WHERE expires_at < now() - make_interval(days => $1)
        "#,
    )
    .bind(REFRESH_TOKEN_RETENTION_DAYS)
    .execute(db)
    .await?;

    Ok(CleanupRun {
        expired_appointments: expired.rows_affected(),
        purged_tokens: purged.rows_affected(),
    })
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

pub fn spawn_reminder_job(
    db: sqlx::PgPool,
    config: Arc<Config>,
    notifier: Arc<NotificationService>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(config.reminder_interval());
        tracing::info!(every_secs = config.reminder_interval_secs, "reminder job started");
        loop {
            tick.tick().await;
            match run_reminders(&db, &config, &notifier).await {
                Ok(run) if run.due > 0 => {
                    tracing::info!(due = run.due, stamped = run.stamped, "appointment reminders processed")
                }
                Ok(_) => tracing::debug!("no reminders due"),
                Err(e) => tracing::error!(error = %e, "reminder job tick failed"),
            }
        }
    })
}

pub fn spawn_cleanup_job(db: sqlx::PgPool, config: Arc<Config>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(config.cleanup_interval());
        tracing::info!(every_secs = config.cleanup_interval_secs, "cleanup job started");
        loop {
            tick.tick().await;
            match run_cleanup(&db, &config).await {
                Ok(run) => tracing::info!(
                    expired = run.expired_appointments,
                    purged_tokens = run.purged_tokens,
                    "cleanup finished"
                ),
                Err(e) => tracing::error!(error = %e, "cleanup job tick failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_attempts_are_retried() {
        assert!(reminder_settled(Delivery { attempted: 0, delivered: 0 }));
        assert!(reminder_settled(Delivery { attempted: 2, delivered: 1 }));
        assert!(!reminder_settled(Delivery { attempted: 2, delivered: 0 }));
    }

    #[test]
    fn reminders_target_the_next_day() {
        let d = NaiveDate::from_ymd_opt(2026, 12, 31).unwrap();
        assert_eq!(reminder_date(d), NaiveDate::from_ymd_opt(2027, 1, 1));
    }
}
