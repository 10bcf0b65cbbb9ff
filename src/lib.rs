pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, BootstrapResult};
pub use application::commands::{
    active_routine_id_impl, add_task_impl, apply_routine_to_date_impl, delete_routine_impl,
    delete_task_impl, edit_task_impl, list_routines_impl, list_tasks_impl, save_routine_impl,
    select_date_impl, set_active_routine_impl, tasks_for_date_impl, toggle_task_impl,
    update_routine_impl, AppState, StoreEvent,
};
pub use application::reminders::{
    reminders_for, run as run_reminder_loop, Reminder, ReminderKind, ReminderScheduler,
};
pub use domain::clock::{
    derive_duration_minutes, format_duration, format_remaining, format_time_12h,
    parse_duration_minutes, parse_time, parse_weekday, span_for, week_start, weekday_name,
    ClockContext, TaskSpan,
};
pub use domain::models::{Activity, Routine, Task, TaskKind};
pub use infrastructure::config::{
    ensure_default_configs, load_app_settings, load_planner_settings, AppSettings, PlannerSettings,
};
pub use infrastructure::error::InfraError;
pub use infrastructure::kv_store::{InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore};
pub use infrastructure::notifier::{
    LogNotificationSink, NotificationSink, PermissionSource, PermissionState,
    StaticPermissionSource,
};
