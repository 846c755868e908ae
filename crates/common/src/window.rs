//! Competition time window used to gate hint retrieval.

use chrono::{DateTime, Local, TimeZone, Timelike};

/// Local-time hours during which hints may be requested.
///
/// Sessions run 10:00-13:00 and 15:00-18:00; hints open in the closing
/// stretch of each session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitionWindow {
    hint_hours: Vec<u32>,
}

impl CompetitionWindow {
    pub fn new(hint_hours: Vec<u32>) -> Self {
        Self { hint_hours }
    }

    /// A window that is always open.
    pub fn always() -> Self {
        Self::new((0..24).collect())
    }

    pub fn hint_hours(&self) -> &[u32] {
        &self.hint_hours
    }

    pub fn is_hint_time<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.hint_hours.contains(&now.hour())
    }

    pub fn is_hint_time_now(&self) -> bool {
        self.is_hint_time(&Local::now())
    }
}

impl Default for CompetitionWindow {
    fn default() -> Self {
        Self::new(vec![11, 12, 16, 17])
    }
}
