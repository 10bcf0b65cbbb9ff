use crate::domain::clock::{parse_time, parse_weekday};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Routine,
    #[default]
    Task,
}

/// One dated occurrence on the timeline. Start time and duration stay as
/// display text and go through the clock module when arithmetic is needed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub time: String,
    pub icon: String,
    pub completed: bool,
    pub date: NaiveDate,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub routine_id: Option<String>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.title, "task.title")?;
        if parse_time(self.date, &self.time).is_none() {
            return Err("task.time must be H:MM AM/PM or HH:MM".to_string());
        }
        if self.kind == TaskKind::Routine && self.routine_id.is_none() {
            return Err("task.routine_id is required for routine tasks".to_string());
        }
        Ok(())
    }
}

/// Template entry owned by exactly one routine. Times are 24-hour HH:MM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub id: String,
    pub title: String,
    pub time: String,
    pub icon: String,
    pub duration: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Activity {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "activity.id")?;
        validate_non_empty(&self.title, "activity.title")?;
        validate_hhmm(&self.time, "activity.time")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Routine {
    pub id: String,
    pub name: String,
    pub activities: Vec<Activity>,
    pub selected_days: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Routine {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "routine.id")?;
        validate_non_empty(&self.name, "routine.name")?;
        if self.activities.is_empty() {
            return Err("routine.activities must not be empty".to_string());
        }
        for activity in &self.activities {
            activity.validate()?;
        }
        for day in &self.selected_days {
            if parse_weekday(day).is_none() {
                return Err(format!("routine.selected_days has unknown day: {day}"));
            }
        }
        Ok(())
    }

    pub fn applies_on(&self, weekday_name: &str) -> bool {
        self.selected_days
            .iter()
            .any(|day| day.eq_ignore_ascii_case(weekday_name))
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_hhmm(value: &str, field_name: &str) -> Result<(), String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map(|_| ())
        .map_err(|_| format!("{field_name} must be HH:MM"))
}
