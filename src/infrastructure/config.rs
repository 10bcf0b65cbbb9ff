use crate::domain::clock::parse_weekday;
use crate::infrastructure::error::InfraError;
use chrono::Weekday;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const PLANNER_JSON: &str = "planner.json";

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "RoutinePlanner",
                "timezone": "UTC"
            }),
        ),
        (
            PLANNER_JSON,
            serde_json::json!({
                "schema": 1,
                "reminderLeadMinutes": 5,
                "weekStartsOn": "sunday"
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub app_name: String,
    pub timezone: Tz,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: "RoutinePlanner".to_string(),
            timezone: Tz::UTC,
        }
    }
}

/// Lenient load: any missing or unreadable field keeps its default.
pub fn load_app_settings(config_dir: &Path) -> AppSettings {
    let mut settings = AppSettings::default();
    let Ok(parsed) = read_config(&config_dir.join(APP_JSON)) else {
        return settings;
    };

    if let Some(name) = parsed
        .get("appName")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        settings.app_name = name.to_string();
    }
    if let Some(timezone) = parsed
        .get("timezone")
        .and_then(serde_json::Value::as_str)
        .and_then(|value| value.trim().parse::<Tz>().ok())
    {
        settings.timezone = timezone;
    }

    settings
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerSettings {
    pub reminder_lead_minutes: i64,
    pub week_starts_on: Weekday,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            reminder_lead_minutes: 5,
            week_starts_on: Weekday::Sun,
        }
    }
}

pub fn load_planner_settings(config_dir: &Path) -> PlannerSettings {
    let mut settings = PlannerSettings::default();
    let Ok(parsed) = read_config(&config_dir.join(PLANNER_JSON)) else {
        return settings;
    };

    if let Some(value) = parsed
        .get("reminderLeadMinutes")
        .and_then(serde_json::Value::as_u64)
    {
        settings.reminder_lead_minutes = value.max(1) as i64;
    }
    if let Some(weekday) = parsed
        .get("weekStartsOn")
        .and_then(serde_json::Value::as_str)
        .and_then(parse_weekday)
    {
        settings.week_starts_on = weekday;
    }

    settings
}
