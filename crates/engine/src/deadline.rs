//! Daily deadline reminders with at-most-once delivery per account, kind and
//! calendar day.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use handle_watch_domain::{
    AccountRecord, Clock, NewReceipt, NotificationKind, Repositories, StorageResult, UserId,
};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    notifier::{escape_html, InlineButton, Notifier},
    pipeline::profile_url,
    settings::GlobalSettings,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlineReport {
    pub sent: usize,
    pub deduplicated: usize,
}

pub struct DeadlineNotifier {
    repos: Arc<dyn Repositories>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    profile_base_url: String,
}

impl DeadlineNotifier {
    pub fn new(
        repos: Arc<dyn Repositories>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        profile_base_url: impl Into<String>,
    ) -> Self {
        Self {
            repos,
            notifier,
            clock,
            profile_base_url: profile_base_url.into(),
        }
    }

    /// One pass over every active user. Safe to repeat on the same day: the
    /// receipt insert decides who sends.
    pub async fn run_once(&self) -> StorageResult<DeadlineReport> {
        let now = self.clock.now();
        let today = self.clock.local_date(now);
        let mut report = DeadlineReport::default();

        for user in self.repos.list_active_users().await? {
            let mut groups: BTreeMap<NotificationKind, Vec<(AccountRecord, i64)>> = BTreeMap::new();
            for account in self.repos.list_pending_accounts(user.id).await? {
                let Some(status) = account.classify_deadline(today) else {
                    continue;
                };
                let inserted = self
                    .repos
                    .try_insert_receipt(NewReceipt {
                        owner: user.id,
                        account: account.id,
                        kind: status.kind,
                        sent_on: today,
                        created_at: now,
                    })
                    .await?;
                if inserted {
                    groups.entry(status.kind).or_default().push((account, status.days));
                } else {
                    report.deduplicated += 1;
                    counter!(
                        "deadline_notifications_total",
                        "kind" => status.kind.as_str(),
                        "result" => "deduplicated"
                    )
                    .increment(1);
                }
            }

            for (kind, entries) in groups {
                self.send_group(user.id, kind, &entries).await;
                report.sent += entries.len();
                counter!(
                    "deadline_notifications_total",
                    "kind" => kind.as_str(),
                    "result" => "sent"
                )
                .increment(entries.len() as u64);
            }
        }

        info!(
            sent = report.sent,
            deduplicated = report.deduplicated,
            "deadline notifications processed"
        );
        Ok(report)
    }

    async fn send_group(&self, user: UserId, kind: NotificationKind, entries: &[(AccountRecord, i64)]) {
        let text = self.render_group(kind, entries);
        let buttons: Vec<InlineButton> = entries
            .iter()
            .map(|(account, _)| {
                InlineButton::new(
                    format!("@{}", account.handle),
                    format!("expiry_{}:{}", kind.callback_token(), account.id),
                )
            })
            .collect();
        // The receipts are already committed; a failed send is not retried today.
        if let Err(err) = self.notifier.send_text(user, &text, &buttons).await {
            warn!(user_id = %user, kind = kind.as_str(), error = %err, "deadline notification failed");
        }
    }

    fn render_group(&self, kind: NotificationKind, entries: &[(AccountRecord, i64)]) -> String {
        let title = match kind {
            NotificationKind::ExpiringSoon => "⏰ <b>Deadlines approaching</b>",
            NotificationKind::Expired => "⚠️ <b>Deadlines passed</b>",
        };
        let mut lines = vec![title.to_string(), String::new()];
        for (account, days) in entries {
            let detail = match kind {
                NotificationKind::ExpiringSoon => format!("{days} days left"),
                NotificationKind::Expired => format!("overdue by {days} days"),
            };
            lines.push(format!(
                "• <a href=\"{}\">@{}</a> ({}): {}",
                escape_html(&profile_url(&self.profile_base_url, &account.handle)),
                escape_html(&account.handle),
                account.deadline().format("%d.%m.%Y"),
                detail
            ));
        }
        lines.join("\n")
    }

    /// Runs [`Self::run_once`] every day at the configured wall-clock time
    /// until `cancel` fires. The time is re-read before each wait.
    pub async fn run_daily(&self, settings: GlobalSettings, cancel: CancellationToken) {
        loop {
            let time = match settings.notification_time().await {
                Ok(time) => time,
                Err(err) => {
                    warn!(error = %err, "cannot read notification time; using default");
                    handle_watch_domain::default_notification_time()
                }
            };
            let now = self.clock.now();
            let next = next_occurrence(now, self.clock.offset(), time);
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next = %next, "next deadline run scheduled");

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(err) = self.run_once().await {
                error!(error = %err, "deadline run failed");
            }
        }
    }
}

/// First instant strictly after `now` whose local wall clock reads `time`.
pub fn next_occurrence(now: DateTime<Utc>, offset: FixedOffset, time: NaiveTime) -> DateTime<Utc> {
    let local_now = now.with_timezone(&offset);
    let mut date = local_now.date_naive();
    loop {
        let candidate = date.and_time(time) - ChronoDuration::seconds(i64::from(offset.local_minus_utc()));
        let candidate = DateTime::<Utc>::from_naive_utc_and_offset(candidate, Utc);
        if candidate > now {
            return candidate;
        }
        date += ChronoDuration::days(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{account, now, today, user, MemoryRepos, RecordingNotifier, Sent};
    use chrono::TimeZone;
    use handle_watch_domain::ManualClock;

    fn setup() -> (Arc<MemoryRepos>, Arc<RecordingNotifier>, Arc<ManualClock>, DeadlineNotifier) {
        let repos = Arc::new(MemoryRepos::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::utc(now()));
        let deadlines = DeadlineNotifier::new(
            repos.clone(),
            notifier.clone(),
            clock.clone(),
            "https://www.instagram.com",
        );
        (repos, notifier, clock, deadlines)
    }

    #[tokio::test]
    async fn same_day_reruns_do_not_resend() {
        let (repos, notifier, clock, deadlines) = setup();
        repos.put_user(user(1));
        let mut due_today = account(10, 1, "alice");
        due_today.start_on = today() - ChronoDuration::days(30);
        repos.put_account(due_today);

        let report = deadlines.run_once().await.unwrap();
        assert_eq!(report, DeadlineReport { sent: 1, deduplicated: 0 });

        clock.advance(ChronoDuration::minutes(5));
        let report = deadlines.run_once().await.unwrap();
        assert_eq!(report, DeadlineReport { sent: 0, deduplicated: 1 });

        assert_eq!(repos.receipt_count(), 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        let Sent::Text { text, buttons, .. } = &sent[0] else {
            panic!("expected text");
        };
        assert!(text.contains("0 days left"));
        assert!(text.contains("https://www.instagram.com/alice/"));
        assert_eq!(buttons[0].callback_data, "expiry_soon:10");
    }

    #[tokio::test]
    async fn groups_by_kind_and_skips_far_and_done() {
        let (repos, notifier, clock, deadlines) = setup();
        repos.put_user(user(1));
        let mut overdue = account(1, 1, "late");
        overdue.start_on = today() - ChronoDuration::days(33);
        let mut soon_a = account(2, 1, "soon_a");
        soon_a.start_on = today() - ChronoDuration::days(25);
        let mut soon_b = account(3, 1, "soon_b");
        soon_b.start_on = today() - ChronoDuration::days(28);
        let far = account(4, 1, "far");
        let mut finished = account(5, 1, "finished");
        finished.start_on = today() - ChronoDuration::days(40);
        finished.done = true;
        for record in [overdue, soon_a, soon_b, far, finished] {
            repos.put_account(record);
        }

        let report = deadlines.run_once().await.unwrap();
        assert_eq!(report.sent, 3);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        let texts: Vec<(String, usize)> = sent
            .iter()
            .map(|message| match message {
                Sent::Text { text, buttons, .. } => (text.clone(), buttons.len()),
                Sent::Photo { .. } => panic!("unexpected photo"),
            })
            .collect();
        assert!(texts[0].0.contains("5 days left"));
        assert!(texts[0].0.contains("2 days left"));
        assert_eq!(texts[0].1, 2);
        assert!(texts[1].0.contains("overdue by 3 days"));

        clock.advance(ChronoDuration::days(1));
        let report = deadlines.run_once().await.unwrap();
        assert_eq!(report.sent, 3);
    }

    #[tokio::test]
    async fn handles_are_escaped_in_html() {
        let (repos, notifier, _clock, deadlines) = setup();
        repos.put_user(user(1));
        let mut odd = account(1, 1, "Tom & <3");
        odd.start_on = today() - ChronoDuration::days(29);
        repos.put_account(odd);

        deadlines.run_once().await.unwrap();
        let sent = notifier.sent();
        let Sent::Text { text, .. } = &sent[0] else {
            panic!("expected text");
        };
        assert!(text.contains("@Tom &amp; &lt;3</a>"));
        assert!(!text.contains("<3"));
    }

    #[tokio::test]
    async fn inactive_users_are_skipped() {
        let (repos, notifier, _clock, deadlines) = setup();
        let mut sleeping = user(1);
        sleeping.active = false;
        repos.put_user(sleeping);
        let mut overdue = account(1, 1, "late");
        overdue.start_on = today() - ChronoDuration::days(40);
        repos.put_account(overdue);

        let report = deadlines.run_once().await.unwrap();
        assert_eq!(report, DeadlineReport::default());
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn next_occurrence_rolls_over_to_tomorrow() {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();

        // 06:00 UTC is 09:00 local.
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 6, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(early, offset, ten),
            Utc.with_ymd_and_hms(2025, 1, 1, 7, 0, 0).unwrap()
        );

        let exactly = Utc.with_ymd_and_hms(2025, 1, 1, 7, 0, 0).unwrap();
        assert_eq!(
            next_occurrence(exactly, offset, ten),
            Utc.with_ymd_and_hms(2025, 1, 2, 7, 0, 0).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn daily_loop_stops_on_cancel() {
        let (repos, _notifier, _clock, deadlines) = setup();
        let settings = GlobalSettings::new(repos);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { deadlines.run_daily(settings, cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
