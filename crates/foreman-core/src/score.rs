//! Candidate scoring: testedness increase and time decay.

use chrono::Duration;

/// Base score for manually-forced jobs.
pub const CANDIDATE_SCORE_FORCE_RUN: f64 = 100.0;

/// Base score for try jobs — equal to building at HEAD when we're five
/// commits behind.
pub const CANDIDATE_SCORE_TRY_JOB: f64 = 10.0;

/// Total "testedness" of a blamelist of `n` commits.
///
/// The testedness of a task spec at a given commit is -1.0 if no task has
/// ever included the commit, 1.0 if a task ran at the commit itself, and
/// 1/N if a task with an N-commit blamelist included it. This sums those
/// contributions over one blamelist.
pub fn testedness(n: i64) -> f64 {
    if n < 0 {
        tracing::error!(commits = n, "testedness called with a negative blamelist length");
        -1.0
    } else if n == 0 {
        0.0
    } else if n == 1 {
        1.0
    } else {
        1.0 + (n as f64 - 1.0) / n as f64
    }
}

/// The increase in testedness obtained by running a task with an
/// `n`-commit blamelist which stole its commits from a previous task
/// with an `m`-commit blamelist (`m == 0` means previously-untested
/// commits).
///
/// Computed as after-minus-before over every affected commit. Retries
/// (`n == m`) yield exactly zero; bisects split a blamelist of `m` into
/// `n` and `m - n`.
pub fn testedness_increase(n: i64, m: i64) -> f64 {
    if n <= 0 || m < 0 {
        return -1.0;
    }
    if m == 0 {
        // Before: -1.0 per uncovered commit.
        let before = -(n as f64);
        testedness(n) - before
    } else if n == m {
        0.0
    } else {
        let before = testedness(m);
        let after = testedness(n) + testedness(m - n);
        after - before
    }
}

/// Linear 24-hour decay multiplier: 1.0 at `elapsed == 0`, `amt_24hr` at
/// 24 hours, clamped at zero. `amt_24hr == 1.0` disables decay.
pub fn time_decay_24hr(amt_24hr: f64, elapsed: Duration) -> f64 {
    if amt_24hr == 1.0 {
        return 1.0;
    }
    let frac = elapsed.num_milliseconds() as f64 / Duration::hours(24).num_milliseconds() as f64;
    (1.0 - (1.0 - amt_24hr) * frac).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn testedness_values() {
        assert!(close(testedness(0), 0.0));
        assert!(close(testedness(1), 1.0));
        assert!(close(testedness(2), 1.5));
        assert!(close(testedness(5), 1.8));
        assert!(close(testedness(-1), -1.0));
    }

    #[test]
    fn fresh_coverage_scores() {
        // Covering one previously-untested commit: 1 - (-1) = 2.
        assert!(close(testedness_increase(1, 0), 2.0));
        // Five untested commits: T(5) + 5 = 5.8.
        assert!(close(testedness_increase(5, 0), 6.8 - 1.0));
        assert!(close(testedness_increase(5, 0), 5.8));
    }

    #[test]
    fn bisect_scores() {
        // Splitting [c5..c1] at c3: blamelist of 2 stolen from 5.
        let s = testedness_increase(2, 5);
        assert!(close(s, testedness(2) + testedness(3) - testedness(5)));
        assert!(s > 0.0);
    }

    #[test]
    fn invalid_inputs_are_sentinel() {
        assert!(close(testedness_increase(0, 0), -1.0));
        assert!(close(testedness_increase(-1, 3), -1.0));
        assert!(close(testedness_increase(3, -1), -1.0));
    }

    #[test]
    fn decay_endpoints() {
        assert!(close(time_decay_24hr(1.0, Duration::hours(100)), 1.0));
        assert!(close(time_decay_24hr(0.5, Duration::zero()), 1.0));
        assert!(close(time_decay_24hr(0.5, Duration::hours(24)), 0.5));
        assert!(close(time_decay_24hr(0.5, Duration::hours(12)), 0.75));
        // Clamped at zero far past the knee.
        assert!(close(time_decay_24hr(0.5, Duration::hours(96)), 0.0));
    }
}
