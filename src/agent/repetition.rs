//! Detection of repeated clicks on the same spot.

use crate::actions::{Action, ScrollDirection};

pub const DEFAULT_REPEAT_RADIUS_PX: f64 = 40.0;
pub const DEFAULT_REPEAT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Click { x: u32, y: u32 },
    Scroll(ScrollDirection),
}

/// Tracks the run of consecutive actions hitting the same target.
///
/// Two clicks are the same target when their pixel targets are within
/// `radius` of each other. Scrolls in the same direction count only when
/// scroll tracking is on. Any other action ends the run.
#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    radius: f64,
    threshold: usize,
    track_scroll: bool,
    last: Option<(Target, String)>,
    run: usize,
}

impl RepetitionDetector {
    pub fn new(radius: f64, threshold: usize) -> Self {
        Self {
            radius,
            threshold: threshold.max(1),
            track_scroll: false,
            last: None,
            run: 0,
        }
    }

    pub fn with_scroll_tracking(mut self, enabled: bool) -> Self {
        self.track_scroll = enabled;
        self
    }

    /// Length of the current run.
    pub fn run(&self) -> usize {
        self.run
    }

    /// Note an action about to be executed. `target` is the click's pixel
    /// position.
    pub fn observe(&mut self, action: &Action, target: Option<(u32, u32)>) {
        let current = match (action, target) {
            (Action::Click { cell }, Some((x, y))) => Some((Target::Click { x, y }, cell.to_string())),
            (Action::Scroll { direction, .. }, _) if self.track_scroll => {
                Some((Target::Scroll(*direction), format!("scroll {}", direction)))
            }
            _ => None,
        };

        let Some((target, label)) = current else {
            self.last = None;
            self.run = 0;
            return;
        };

        let same = self
            .last
            .as_ref()
            .is_some_and(|(previous, _)| self.same_target(previous, &target));
        self.run = if same { self.run + 1 } else { 1 };
        self.last = Some((target, label));
    }

    /// Warning for the next request once the run reaches the threshold.
    pub fn warning(&self) -> Option<String> {
        if self.run < self.threshold {
            return None;
        }
        let (target, label) = self.last.as_ref()?;
        Some(match target {
            Target::Click { .. } => format!(
                "The last {} CLICK actions all targeted {}. The screen probably changed after \
                the first click. Look at the current screenshot carefully and do not click \
                there again unless you are certain it is needed.",
                self.run, label
            ),
            Target::Scroll(_) => format!(
                "The last {} actions were all {}. If the screen no longer changes you have \
                reached the end of the list; try a different approach.",
                self.run, label
            ),
        })
    }

    fn same_target(&self, a: &Target, b: &Target) -> bool {
        match (a, b) {
            (Target::Click { x: x1, y: y1 }, Target::Click { x: x2, y: y2 }) => {
                let dx = *x1 as f64 - *x2 as f64;
                let dy = *y1 as f64 - *y2 as f64;
                (dx * dx + dy * dy).sqrt() <= self.radius
            }
            (Target::Scroll(d1), Target::Scroll(d2)) => d1 == d2,
            _ => false,
        }
    }
}

impl Default for RepetitionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_RADIUS_PX, DEFAULT_REPEAT_THRESHOLD)
    }
}
