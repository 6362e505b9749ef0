use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW_SIZE: u32 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchDirection {
    Forward,
    Backward,
    Both,
}

// Contiguous run of `size` calendar days starting at `start`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusWindow {
    pub start: NaiveDate,
    pub size: u32,
}

impl FocusWindow {
    // Window centred on `selected` (size 5 -> selected-2 ..= selected+2).
    pub fn around(selected: NaiveDate, size: u32) -> Self {
        let size = size.max(1);
        let start = selected
            .checked_sub_days(Days::new(u64::from(size / 2)))
            .unwrap_or(selected);
        Self { start, size }
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        (0..self.size)
            .filter_map(|i| self.start.checked_add_days(Days::new(u64::from(i))))
            .collect()
    }

    pub fn end(&self) -> NaiveDate {
        self.start
            .checked_add_days(Days::new(u64::from(self.size.saturating_sub(1))))
            .unwrap_or(self.start)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end()
    }

    // `count` days just outside the window on the requested side(s).
    pub fn adjacent(&self, direction: PrefetchDirection, count: u32) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        if matches!(direction, PrefetchDirection::Forward | PrefetchDirection::Both) {
            let end = self.end();
            out.extend((1..=count).filter_map(|i| end.checked_add_days(Days::new(u64::from(i)))));
        }
        if matches!(direction, PrefetchDirection::Backward | PrefetchDirection::Both) {
            out.extend(
                (1..=count).filter_map(|i| self.start.checked_sub_days(Days::new(u64::from(i)))),
            );
        }
        out
    }

    // Which way the focus moved when going from `self` to `next`.
    pub fn direction_to(&self, next: &FocusWindow) -> PrefetchDirection {
        match next.start.cmp(&self.start) {
            std::cmp::Ordering::Greater => PrefetchDirection::Forward,
            std::cmp::Ordering::Less => PrefetchDirection::Backward,
            std::cmp::Ordering::Equal => PrefetchDirection::Both,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn window_is_centred_and_contiguous() {
        let w = FocusWindow::around(d("2024-03-01"), DEFAULT_WINDOW_SIZE);
        assert_eq!(
            w.days(),
            vec![
                d("2024-02-28"),
                d("2024-02-29"),
                d("2024-03-01"),
                d("2024-03-02"),
                d("2024-03-03"),
            ]
        );
        assert_eq!(w.end(), d("2024-03-03"));
        assert!(w.contains(d("2024-02-28")));
        assert!(!w.contains(d("2024-03-04")));
    }

    #[test]
    fn adjacent_days_follow_direction() {
        let w = FocusWindow::around(d("2024-03-10"), 5);
        let ahead = w.adjacent(PrefetchDirection::Forward, 2);
        assert_eq!(ahead, vec![d("2024-03-13"), d("2024-03-14")]);
        assert_eq!(w.adjacent(PrefetchDirection::Backward, 1), vec![d("2024-03-07")]);
        assert_eq!(w.adjacent(PrefetchDirection::Both, 1).len(), 2);
    }

    #[test]
    fn direction_tracks_window_moves() {
        let a = FocusWindow::around(d("2024-03-10"), 5);
        let b = FocusWindow::around(d("2024-03-11"), 5);
        assert_eq!(a.direction_to(&b), PrefetchDirection::Forward);
        assert_eq!(b.direction_to(&a), PrefetchDirection::Backward);
        assert_eq!(a.direction_to(&a), PrefetchDirection::Both);
    }
}
