/// Highest progress a job may report before it finishes.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Maps one log line to a progress percentage, if the line carries one.
pub trait ProgressEstimator: Send + Sync {
    fn observe(&self, line: &str) -> Option<u8>;
}

/// Recognizes `[k/N]` and bare `k/N` counters; the last counter on a line wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct FractionProgress;

impl ProgressEstimator for FractionProgress {
    fn observe(&self, line: &str) -> Option<u8> {
        line.split_whitespace()
            .filter_map(parse_fraction)
            .last()
            .map(|(done, total)| {
                let percent = done.saturating_mul(100) / total;
                percent.min(u64::from(MAX_RUNNING_PROGRESS)) as u8
            })
    }
}

fn parse_fraction(token: &str) -> Option<(u64, u64)> {
    let token = token.trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')' | ',' | ':' | '.'));
    let (done, total) = token.split_once('/')?;
    let done: u64 = done.parse().ok()?;
    let total: u64 = total.parse().ok()?;
    (total > 0 && done <= total).then_some((done, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bracketed_and_bare_counters() {
        let estimator = FractionProgress;
        assert_eq!(estimator.observe("[1/4] verifying task-1"), Some(25));
        assert_eq!(estimator.observe("processed 3/4 tasks"), Some(75));
        assert_eq!(estimator.observe("step (2/8): done"), Some(25));
    }

    #[test]
    fn completion_is_capped_until_the_job_finishes() {
        assert_eq!(FractionProgress.observe("[10/10] last task"), Some(99));
    }

    #[test]
    fn ignores_lines_without_valid_counters() {
        let estimator = FractionProgress;
        assert_eq!(estimator.observe("connecting to servers/tools.py"), None);
        assert_eq!(estimator.observe("ratio 5/0"), None);
        assert_eq!(estimator.observe("7/3 is not progress"), None);
        assert_eq!(estimator.observe("see http://host/a/b"), None);
    }
}
