use crate::buffer::OutputBuffer;
use crate::config::ConvergenceConfig;
use crate::supervisor::Liveness;
use crate::waiter::stopped;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which ptp4l summary line an offset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    /// `ptp4l[..]: master offset <ns> s2 freq ...`
    Master,
    /// `ptp4l[..]: rms <ns> max <ns> freq ...`
    Rms,
}

/// Recognise an offset-bearing line and return the raw offset token.
///
/// Lines too short to hold the token are not offset lines.
pub fn offset_field(line: &str) -> Option<(OffsetKind, &str)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.get(1..) {
        Some(["master", "offset", value, ..]) => Some((OffsetKind::Master, *value)),
        Some(["rms", value, ..]) => Some((OffsetKind::Rms, *value)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Waiting,
    /// Non-strict verdict: the client reported an offset at all.
    Synchronizing,
    /// Strict verdict: enough consecutive offsets below the threshold.
    Synchronized,
    /// The budget ran out (or the client died) while still waiting.
    Failed,
}

impl ConvergenceState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConvergenceState::Waiting)
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            ConvergenceState::Synchronizing | ConvergenceState::Synchronized
        )
    }
}

/// Debounce state machine over the client's log lines.
///
/// In strict mode an offset counts only if its absolute value is strictly
/// below `threshold`; any other parsed offset resets the run. The run is
/// shared between master-offset and rms lines.
#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    strict: bool,
    threshold: i64,
    required_repeats: u32,
    consecutive: u32,
    state: ConvergenceState,
}

impl ConvergenceDetector {
    pub fn new(strict: bool, threshold: i64, required_repeats: u32) -> Self {
        Self {
            strict,
            threshold,
            required_repeats: required_repeats.max(1),
            consecutive: 0,
            state: ConvergenceState::Waiting,
        }
    }

    pub fn from_config(config: &ConvergenceConfig, strict: bool) -> Self {
        Self::new(strict, config.threshold_ns, config.required_repeats)
    }

    pub fn state(&self) -> ConvergenceState {
        self.state
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Feed one complete line. Lines arriving after a verdict are ignored.
    pub fn feed_line(&mut self, line: &str) -> ConvergenceState {
        if self.state.is_terminal() {
            return self.state;
        }
        let Some((kind, raw)) = offset_field(line) else {
            return self.state;
        };

        if !self.strict {
            info!(?kind, "client synchronizing");
            self.state = ConvergenceState::Synchronizing;
            return self.state;
        }

        let offset: i64 = match raw.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(?kind, value = raw, error = %e, "unparseable offset, ignoring line");
                return self.state;
            }
        };

        if offset.unsigned_abs() < self.threshold.unsigned_abs() {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        debug!(
            ?kind,
            offset_ns = offset,
            consecutive = self.consecutive,
            required = self.required_repeats,
            "offset sample"
        );

        if self.consecutive >= self.required_repeats {
            info!(offset_ns = offset, "client synchronized");
            self.state = ConvergenceState::Synchronized;
        }
        self.state
    }

    /// Give up: a detector still waiting becomes `Failed`.
    pub fn expire(&mut self) -> ConvergenceState {
        if self.state == ConvergenceState::Waiting {
            self.state = ConvergenceState::Failed;
        }
        self.state
    }
}

/// Outcome of a monitoring session.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub state: ConvergenceState,
    pub elapsed_ms: u64,
    pub lines_seen: usize,
    /// Every line the detector consumed, for diagnostics.
    #[serde(skip)]
    pub lines: Vec<String>,
}

/// Drive `detector` from the complete lines of `buffer` until it reaches a
/// verdict, `budget` elapses, or `liveness` reports the process gone.
pub async fn monitor(
    buffer: &OutputBuffer,
    detector: &mut ConvergenceDetector,
    budget: Duration,
    liveness: Option<&Liveness>,
) -> ConvergenceReport {
    let started = Instant::now();
    let deadline = started + budget;
    let mut changes = buffer.subscribe();
    let mut cursor = 0;
    let mut consumed = Vec::new();
    let mut liveness = liveness.cloned();

    let finish = |state, consumed: Vec<String>| ConvergenceReport {
        state,
        elapsed_ms: started.elapsed().as_millis() as u64,
        lines_seen: consumed.len(),
        lines: consumed,
    };

    loop {
        changes.borrow_and_update();
        let (lines, next) = buffer.lines_after(cursor);
        cursor = next;
        for line in lines {
            let state = detector.feed_line(&line);
            consumed.push(line);
            if state.is_terminal() {
                return finish(state, consumed);
            }
        }

        if liveness.as_ref().is_some_and(|l| !l.is_running()) {
            // Catch lines appended between the read above and the exit.
            let (lines, _) = buffer.lines_after(cursor);
            for line in lines {
                let state = detector.feed_line(&line);
                consumed.push(line);
                if state.is_terminal() {
                    return finish(state, consumed);
                }
            }
            warn!("client exited before converging");
            return finish(detector.expire(), consumed);
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    return finish(detector.expire(), consumed);
                }
            }
            _ = stopped(&mut liveness) => {}
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    budget_secs = budget.as_secs(),
                    state = ?detector.state(),
                    consecutive = detector.consecutive(),
                    "convergence budget expired"
                );
                return finish(detector.expire(), consumed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ProcessState;
    use tokio::sync::watch;

    fn master(ns: i64) -> String {
        format!("ptp4l[1234.567]: master offset {ns} s2 freq -1234 path delay 5678")
    }

    fn rms(ns: i64) -> String {
        format!("ptp4l[1234.567]: rms {ns} max 20 freq -1234 +/- 3 delay 100 +/- 1")
    }

    fn feed_all(detector: &mut ConvergenceDetector, lines: &[String]) -> Vec<ConvergenceState> {
        lines.iter().map(|l| detector.feed_line(l)).collect()
    }

    #[test]
    fn test_offset_field_shapes() {
        assert_eq!(
            offset_field(&master(-12)),
            Some((OffsetKind::Master, "-12"))
        );
        assert_eq!(offset_field(&rms(7)), Some((OffsetKind::Rms, "7")));
        assert_eq!(offset_field("ptp4l[1.0]: port 1: LISTENING"), None);
        assert_eq!(offset_field("ptp4l[1.0]: master offset"), None);
        assert_eq!(offset_field("ptp4l[1.0]: rms"), None);
        assert_eq!(offset_field(""), None);
        assert_eq!(offset_field("master offset 5"), None);
    }

    #[test]
    fn test_example_sequence_converges_on_fourth_sample() {
        let mut d = ConvergenceDetector::new(true, 100, 3);
        let states = feed_all(&mut d, &[master(150), master(40), master(30), master(-20)]);
        assert_eq!(
            states,
            vec![
                ConvergenceState::Waiting,
                ConvergenceState::Waiting,
                ConvergenceState::Waiting,
                ConvergenceState::Synchronized,
            ]
        );
        // Later lines do not change the verdict.
        assert_eq!(d.feed_line(&master(10_000)), ConvergenceState::Synchronized);
    }

    #[test]
    fn test_never_declared_before_required_repeats() {
        let mut d = ConvergenceDetector::new(true, 100, 5);
        for i in 0..4 {
            assert_eq!(d.feed_line(&master(i)), ConvergenceState::Waiting);
        }
        assert_eq!(d.consecutive(), 4);
        assert_eq!(d.feed_line(&master(4)), ConvergenceState::Synchronized);
    }

    #[test]
    fn test_exact_threshold_resets() {
        let mut d = ConvergenceDetector::new(true, 100, 3);
        feed_all(&mut d, &[master(10), master(20)]);
        assert_eq!(d.consecutive(), 2);
        d.feed_line(&master(100));
        assert_eq!(d.consecutive(), 0);
        d.feed_line(&master(-100));
        assert_eq!(d.consecutive(), 0);
        d.feed_line(&master(99));
        assert_eq!(d.consecutive(), 1);
    }

    #[test]
    fn test_out_of_tolerance_resets_after_any_run() {
        for run in 0..3 {
            let mut d = ConvergenceDetector::new(true, 100, 3);
            for _ in 0..run {
                d.feed_line(&master(1));
            }
            d.feed_line(&master(-500));
            assert_eq!(d.consecutive(), 0, "run of {run}");
            assert_eq!(d.state(), ConvergenceState::Waiting);
        }
    }

    #[test]
    fn test_count_shared_across_shapes() {
        let mut d = ConvergenceDetector::new(true, 100, 3);
        let states = feed_all(&mut d, &[master(5), rms(6), master(-7)]);
        assert_eq!(states[2], ConvergenceState::Synchronized);
    }

    #[test]
    fn test_rms_out_of_tolerance_resets_master_run() {
        let mut d = ConvergenceDetector::new(true, 100, 3);
        feed_all(&mut d, &[master(5), master(6), rms(300)]);
        assert_eq!(d.consecutive(), 0);
    }

    #[test]
    fn test_parse_failure_is_inert() {
        let mut d = ConvergenceDetector::new(true, 100, 3);
        d.feed_line(&master(5));
        d.feed_line(&master(6));
        assert_eq!(
            d.feed_line("ptp4l[1.0]: master offset abc s2"),
            ConvergenceState::Waiting
        );
        assert_eq!(d.consecutive(), 2);
        assert_eq!(d.feed_line(&master(7)), ConvergenceState::Synchronized);
    }

    #[test]
    fn test_unrelated_lines_ignored() {
        let mut d = ConvergenceDetector::new(true, 100, 1);
        assert_eq!(
            d.feed_line("ptp4l[1.0]: selected best master clock 001122.fffe.334455"),
            ConvergenceState::Waiting
        );
        assert_eq!(d.consecutive(), 0);
    }

    #[test]
    fn test_non_strict_converges_on_first_offset() {
        let mut d = ConvergenceDetector::new(false, 100, 5);
        assert_eq!(d.feed_line("ptp4l[1.0]: port 1: LISTENING"), ConvergenceState::Waiting);
        assert_eq!(
            d.feed_line(&master(987_654_321)),
            ConvergenceState::Synchronizing
        );
    }

    #[test]
    fn test_non_strict_accepts_rms_and_unparseable_values() {
        let mut d = ConvergenceDetector::new(false, 100, 5);
        assert_eq!(d.feed_line(&rms(100_000)), ConvergenceState::Synchronizing);
        let mut d = ConvergenceDetector::new(false, 100, 5);
        assert_eq!(
            d.feed_line("ptp4l[1.0]: master offset nan s0"),
            ConvergenceState::Synchronizing
        );
    }

    #[test]
    fn test_extreme_offset_does_not_overflow() {
        let mut d = ConvergenceDetector::new(true, 100, 1);
        assert_eq!(d.feed_line(&master(i64::MIN)), ConvergenceState::Waiting);
    }

    #[test]
    fn test_expire_only_fails_waiting() {
        let mut d = ConvergenceDetector::new(true, 100, 1);
        assert_eq!(d.expire(), ConvergenceState::Failed);
        let mut d = ConvergenceDetector::new(true, 100, 1);
        d.feed_line(&master(0));
        assert_eq!(d.expire(), ConvergenceState::Synchronized);
    }

    #[test]
    fn test_zero_repeats_clamped_to_one() {
        let mut d = ConvergenceDetector::new(true, 100, 0);
        assert_eq!(d.state(), ConvergenceState::Waiting);
        assert_eq!(d.feed_line(&master(1)), ConvergenceState::Synchronized);
    }

    #[tokio::test]
    async fn test_monitor_converges_on_live_buffer() {
        let buffer = OutputBuffer::new();
        let writer = buffer.clone();
        tokio::spawn(async move {
            for ns in [900, 40, 30, -20] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                writer.append(format!("{}\n", master(ns)).as_bytes());
            }
        });

        let mut d = ConvergenceDetector::new(true, 100, 3);
        let report = monitor(&buffer, &mut d, Duration::from_secs(10), None).await;
        assert_eq!(report.state, ConvergenceState::Synchronized);
        assert_eq!(report.lines_seen, 4);
    }

    #[tokio::test]
    async fn test_monitor_waits_for_line_terminator() {
        let buffer = OutputBuffer::new();
        buffer.append(b"ptp4l[1.0]: master offset 5 s2");
        let writer = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(b" freq 1\n");
        });

        let mut d = ConvergenceDetector::new(true, 100, 1);
        let report = monitor(&buffer, &mut d, Duration::from_secs(10), None).await;
        assert_eq!(report.state, ConvergenceState::Synchronized);
        assert_eq!(report.lines, vec!["ptp4l[1.0]: master offset 5 s2 freq 1"]);
    }

    #[tokio::test]
    async fn test_monitor_fails_with_transcript_on_budget() {
        let buffer = OutputBuffer::new();
        buffer.append(format!("{}\n{}\n", master(5000), rms(4000)).as_bytes());
        let mut d = ConvergenceDetector::new(true, 100, 3);
        let report = monitor(&buffer, &mut d, Duration::from_millis(100), None).await;
        assert_eq!(report.state, ConvergenceState::Failed);
        assert_eq!(report.lines.len(), 2);
        assert!(report.elapsed_ms >= 100);
    }

    #[tokio::test]
    async fn test_monitor_stops_when_client_dies() {
        let buffer = OutputBuffer::new();
        buffer.append(format!("{}\n", master(5000)).as_bytes());
        let (tx, rx) = watch::channel(ProcessState::Running);
        let liveness = Liveness::new(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(ProcessState::Lost);
        });

        let mut d = ConvergenceDetector::new(true, 100, 3);
        let start = std::time::Instant::now();
        let report = monitor(&buffer, &mut d, Duration::from_secs(30), Some(&liveness)).await;
        assert_eq!(report.state, ConvergenceState::Failed);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
