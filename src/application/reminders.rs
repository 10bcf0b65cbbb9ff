use crate::application::commands::{list_tasks_impl, AppState, StoreEvent};
use crate::domain::clock::{format_time_12h, span_for};
use crate::domain::models::Task;
use crate::infrastructure::notifier::{NotificationSink, PermissionSource, PermissionState};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    StartingSoon,
    AtStart,
    EndingSoon,
}

/// One armed notification instant for a task occurring today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub task_id: String,
    pub kind: ReminderKind,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub fire_at: NaiveDateTime,
}

/// Computes the reminder set for tasks dated `today`. Each task yields up
/// to three instants (lead before start, at start, lead before end); an
/// instant is kept only when it is strictly in the future and less than
/// 24 hours away.
pub fn reminders_for(
    tasks: &[Task],
    today: NaiveDate,
    now: NaiveDateTime,
    lead_minutes: i64,
) -> Vec<Reminder> {
    let lead = Duration::minutes(lead_minutes);
    let horizon = now + Duration::hours(24);
    let mut reminders = Vec::new();

    for task in tasks.iter().filter(|task| task.date == today) {
        let Some(span) = span_for(task.date, &task.time, task.duration.as_deref()) else {
            continue;
        };
        let description_suffix = task
            .description
            .as_deref()
            .map(|description| format!(" • {description}"))
            .unwrap_or_default();

        let candidates = [
            (
                ReminderKind::StartingSoon,
                span.start - lead,
                format!("Starting soon: {}", task.title),
                format!("{} in {} minutes{}", task.time, lead_minutes, description_suffix),
            ),
            (
                ReminderKind::AtStart,
                span.start,
                format!("Task starting: {}", task.title),
                format!("{}{}", task.time, description_suffix),
            ),
            (
                ReminderKind::EndingSoon,
                span.end - lead,
                format!("Ending soon: {}", task.title),
                format!(
                    "Ends at {} in {} minutes",
                    format_time_12h(span.end.time()),
                    lead_minutes
                ),
            ),
        ];

        for (kind, fire_at, title, body) in candidates {
            if fire_at > now && fire_at < horizon {
                reminders.push(Reminder {
                    task_id: task.id.clone(),
                    kind,
                    title,
                    body,
                    icon: task.icon.clone(),
                    fire_at,
                });
            }
        }
    }

    reminders
}

/// Owns the armed one-shot timers. `rearm` cancels the previous set before
/// arming the next one, so a stale task snapshot can never fire.
pub struct ReminderScheduler {
    relay: Option<Arc<dyn NotificationSink>>,
    local: Arc<dyn NotificationSink>,
    permissions: Arc<dyn PermissionSource>,
    armed: Mutex<Vec<JoinHandle<()>>>,
}

impl ReminderScheduler {
    pub fn new(local: Arc<dyn NotificationSink>, permissions: Arc<dyn PermissionSource>) -> Self {
        Self {
            relay: None,
            local,
            permissions,
            armed: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the background delivery collaborator. Without one, fired
    /// reminders fall back to the local sink.
    pub fn with_relay(mut self, relay: Arc<dyn NotificationSink>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn armed_len(&self) -> usize {
        self.armed.lock().map(|armed| armed.len()).unwrap_or(0)
    }

    pub fn cancel_all(&self) {
        let Ok(mut armed) = self.armed.lock() else {
            return;
        };
        for handle in armed.drain(..) {
            handle.abort();
        }
    }

    /// Asks for permission when it is still undecided. Fire and forget;
    /// a denied answer simply keeps the scheduler idle.
    pub async fn ensure_permission(&self) -> PermissionState {
        match self.permissions.current_permission() {
            PermissionState::Default => self.permissions.request_permission().await,
            state => state,
        }
    }

    /// Atomically replaces the armed set: cancels every previous timer,
    /// then arms one timer per reminder relative to `now`. Arms nothing
    /// without granted permission.
    pub fn rearm(&self, reminders: Vec<Reminder>, now: NaiveDateTime) {
        let Ok(mut armed) = self.armed.lock() else {
            return;
        };
        for handle in armed.drain(..) {
            handle.abort();
        }

        if self.permissions.current_permission() != PermissionState::Granted {
            return;
        }

        for reminder in reminders {
            let delay = (reminder.fire_at - now).to_std().unwrap_or_default();
            let sink = self.relay.clone().unwrap_or_else(|| Arc::clone(&self.local));
            armed.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sink
                    .deliver(&reminder.title, &reminder.body, &reminder.icon)
                    .await;
            }));
        }
    }
}

/// Subscriber loop: rearms today's reminders whenever the task set or the
/// selected date changes. Returns the spawned handle; the loop ends when
/// the state's event channel closes.
pub fn run(state: Arc<AppState>, scheduler: Arc<ReminderScheduler>) -> JoinHandle<()> {
    let mut events = state.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StoreEvent::TasksChanged) | Ok(StoreEvent::DateSelected) => {
                    let Ok(tasks) = list_tasks_impl(&state) else {
                        continue;
                    };
                    let now_utc = Utc::now();
                    let clock = state.clock();
                    let today = clock.today(now_utc);
                    let now = clock.local_now(now_utc);
                    let reminders =
                        reminders_for(&tasks, today, now, state.settings().reminder_lead_minutes);
                    scheduler.rearm(reminders, now);
                }
                Ok(StoreEvent::RoutinesChanged) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}
