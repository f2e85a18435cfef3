// src/model/timetable.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// **周排期** day(0-6, 0 = 周日) → hour(0-23) → 是否允许
///
/// 空排期表示全天候投放；非空时未列出的时段一律不投。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Timetable(BTreeMap<u8, BTreeMap<u8, bool>>);

impl Timetable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, day: u8, hour: u8, allowed: bool) {
        self.0.entry(day).or_default().insert(hour, allowed);
    }

    pub fn allow(mut self, day: u8, hour: u8) -> Self {
        self.set(day, hour, true);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self, day: u32, hour: u32) -> bool {
        if day > 6 || hour > 23 {
            return false;
        }
        if self.0.is_empty() {
            return true;
        }
        // 上面已校验范围，转换不会截断
        self.0
            .get(&(day as u8))
            .and_then(|hours| hours.get(&(hour as u8)))
            .copied()
            .unwrap_or(false)
    }

    pub fn validate_at<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.validate(at.weekday().num_days_from_sunday(), at.hour())
    }
}
