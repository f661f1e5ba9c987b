// src/scheduler.rs
use crate::broadcast::{Broadcaster, OutboundEvent};
use crate::persistence::history::HistoryArchive;
use crate::trading::manager::StateMachineManager;
use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The first wall-clock minute boundary strictly after `now`.
pub fn next_minute<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let into_minute = chrono::Duration::seconds(i64::from(now.second()))
        + chrono::Duration::nanoseconds(i64::from(now.nanosecond()));
    now.clone() - into_minute + chrono::Duration::minutes(1)
}

/// Time left until `target`; zero once it has passed.
pub fn until<Tz: TimeZone>(target: &DateTime<Tz>, now: &DateTime<Tz>) -> Duration {
    (target.clone() - now.clone()).to_std().unwrap_or(Duration::ZERO)
}

/// The trading day that ends at this instant, if it is local midnight.
pub fn finished_day<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<NaiveDate> {
    if now.hour() != 0 || now.minute() != 0 {
        return None;
    }
    now.date_naive().checked_sub_days(Days::new(1))
}

/// Minute-boundary retry sweep plus the midnight archive and reset.
pub struct MinuteScheduler {
    manager: Arc<StateMachineManager>,
    archive: HistoryArchive,
    broadcaster: Broadcaster,
}

impl MinuteScheduler {
    pub fn new(
        manager: Arc<StateMachineManager>,
        archive: HistoryArchive,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            manager,
            archive,
            broadcaster,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Each boundary is handled once and under its own label, however
            // early or late the timer fires.
            let mut boundary = next_minute(&Local::now());
            loop {
                tokio::time::sleep(until(&boundary, &Local::now())).await;
                self.on_minute(boundary).await;
                boundary = next_minute(&Local::now().max(boundary));
            }
        })
    }

    pub async fn on_minute<Tz: TimeZone>(&self, now: DateTime<Tz>) {
        for snapshot in self.manager.minute_retry().await {
            self.broadcaster.send(OutboundEvent::Fsm(snapshot));
        }

        if let Some(day) = finished_day(&now) {
            self.end_of_day(day).await;
        }
    }

    /// Archive `day`, then start the next one from a clean slate.
    pub async fn end_of_day(&self, day: NaiveDate) {
        log::info!("[Scheduler] Midnight, archiving {} and resetting", day);
        if let Err(e) = self.archive.archive(day, &self.manager).await {
            log::error!("[Scheduler] Failed to archive {}: {}", day, e);
        }
        self.manager.daily_reset().await;

        for token in self.manager.tokens() {
            if let Some(snapshot) = self.manager.snapshot(*token).await {
                self.broadcaster.send(OutboundEvent::Fsm(snapshot));
            }
            self.broadcaster.send(OutboundEvent::Signals {
                token: *token,
                signals: Vec::new(),
            });
        }
    }
}
