use std::collections::VecDeque;

/// Window length; the fit is unreliable below a few hundred samples.
pub const EARLY_STOP_WINDOW: usize = 300;

/// How often (in visits) the heuristic is evaluated once the window is full.
pub const EARLY_STOP_INTERVAL: usize = 100;

/// One-sided z beyond which less than 1% of the fitted normal remains.
const Z_99: f32 = 2.326;

/// A sliding window over recent approximate scores, fitted to a normal
/// distribution to decide whether the search frontier is still worth
/// expanding.
///
/// The search stops when the estimated probability of the next scored node
/// beating the current rerank floor drops below 1%, i.e. when
/// `(floor - mean) / std > 2.326`. The window must be full before the
/// heuristic fires, and a degenerate window (zero variance) falls back to a
/// direct mean-vs-floor comparison.
pub struct ScoreWindow {
    scores: VecDeque<f32>,
    sum: f64,
    sum_sq: f64,
}

impl ScoreWindow {
    pub fn new() -> Self {
        ScoreWindow {
            scores: VecDeque::with_capacity(EARLY_STOP_WINDOW),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Records an approximate score, evicting the oldest once full.
    pub fn push(&mut self, score: f32) {
        if self.scores.len() == EARLY_STOP_WINDOW {
            let old = self.scores.pop_front().unwrap() as f64;
            self.sum -= old;
            self.sum_sq -= old * old;
        }
        self.scores.push_back(score);
        self.sum += score as f64;
        self.sum_sq += score as f64 * score as f64;
    }

    pub fn is_full(&self) -> bool {
        self.scores.len() == EARLY_STOP_WINDOW
    }

    pub fn mean(&self) -> f32 {
        if self.scores.is_empty() {
            return 0.0;
        }
        (self.sum / self.scores.len() as f64) as f32
    }

    pub fn std(&self) -> f32 {
        let n = self.scores.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.sum / n as f64;
        let var = (self.sum_sq / n as f64 - mean * mean).max(0.0);
        var.sqrt() as f32
    }

    /// Whether the fitted distribution says a score above `floor` has become
    /// a sub-1% event. Never fires before the window is full.
    pub fn should_stop(&self, floor: f32) -> bool {
        if !self.is_full() {
            return false;
        }
        let std = self.std();
        if std <= f32::EPSILON {
            // all recent scores identical: stop iff they sit below the floor
            return self.mean() < floor;
        }
        (floor - self.mean()) / std > Z_99
    }

    pub fn clear(&mut self) {
        self.scores.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

impl Default for ScoreWindow {
    fn default() -> Self {
        ScoreWindow::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_distr::Normal;

    #[test]
    fn never_fires_before_the_window_fills() {
        let mut w = ScoreWindow::new();
        for _ in 0..EARLY_STOP_WINDOW - 1 {
            w.push(0.0);
        }
        assert!(!w.should_stop(0.99));
        w.push(0.0);
        assert!(w.should_stop(0.99));
    }

    #[test]
    fn tracks_mean_and_std_of_a_known_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(0.4f32, 0.05f32).unwrap();

        let mut w = ScoreWindow::new();
        for _ in 0..EARLY_STOP_WINDOW {
            w.push(normal.sample(&mut rng));
        }

        assert!((w.mean() - 0.4).abs() < 0.02, "mean {}", w.mean());
        assert!((w.std() - 0.05).abs() < 0.02, "std {}", w.std());
    }

    #[test]
    fn fires_only_when_the_floor_is_far_above_the_mass() {
        let mut rng = StdRng::seed_from_u64(8);
        let normal = Normal::new(0.4f32, 0.05f32).unwrap();

        let mut w = ScoreWindow::new();
        for _ in 0..EARLY_STOP_WINDOW {
            w.push(normal.sample(&mut rng));
        }

        // floor inside the distribution: plenty of probability above it
        assert!(!w.should_stop(0.45));
        // floor several sigmas out: effectively unreachable
        assert!(w.should_stop(0.7));
    }

    #[test]
    fn sliding_eviction_forgets_old_scores() {
        let mut w = ScoreWindow::new();
        for _ in 0..EARLY_STOP_WINDOW {
            w.push(1.0);
        }
        assert!((w.mean() - 1.0).abs() < 1e-6);
        for _ in 0..EARLY_STOP_WINDOW {
            w.push(0.0);
        }
        assert!(w.mean().abs() < 1e-6);
    }

    #[test]
    fn clear_resets_the_fit() {
        let mut w = ScoreWindow::new();
        for _ in 0..EARLY_STOP_WINDOW {
            w.push(0.9);
        }
        w.clear();
        assert!(!w.is_full());
        assert_eq!(w.mean(), 0.0);
    }
}
