//! Inline keyboards and the callback data they carry.
//!
//! Callback data is `<action>:<arg>`. Anything that does not parse to a
//! known action is `CallbackAction::Unknown`.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::bot::chart::CHART_PERIODS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Chart(u32),
    Model(String),
    ClearConfirm,
    ClearCancel,
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Self {
        let Some((action, arg)) = data.split_once(':') else {
            return CallbackAction::Unknown;
        };

        match (action, arg) {
            ("chart", days) => match days.parse::<u32>() {
                Ok(d) if CHART_PERIODS.contains(&d) => CallbackAction::Chart(d),
                _ => CallbackAction::Unknown,
            },
            ("model", name) if !name.is_empty() => CallbackAction::Model(name.to_string()),
            ("clear", "yes") => CallbackAction::ClearConfirm,
            ("clear", "no") => CallbackAction::ClearCancel,
            _ => CallbackAction::Unknown,
        }
    }

    pub fn data(&self) -> String {
        match self {
            CallbackAction::Chart(days) => format!("chart:{days}"),
            CallbackAction::Model(name) => format!("model:{name}"),
            CallbackAction::ClearConfirm => "clear:yes".to_string(),
            CallbackAction::ClearCancel => "clear:no".to_string(),
            CallbackAction::Unknown => String::new(),
        }
    }
}

pub fn chart_keyboard() -> InlineKeyboardMarkup {
    let row = CHART_PERIODS
        .iter()
        .map(|d| InlineKeyboardButton::callback(format!("{d} days"), CallbackAction::Chart(*d).data()))
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

/// One model per row; the current one is marked.
pub fn model_keyboard(models: &[String], current: &str) -> InlineKeyboardMarkup {
    let rows = models
        .iter()
        .map(|m| {
            let label = if m == current { format!("✅ {m}") } else { m.clone() };
            vec![InlineKeyboardButton::callback(label, CallbackAction::Model(m.clone()).data())]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub fn clear_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("Yes, forget it", CallbackAction::ClearConfirm.data()),
        InlineKeyboardButton::callback("Cancel", CallbackAction::ClearCancel.data()),
    ]])
}
