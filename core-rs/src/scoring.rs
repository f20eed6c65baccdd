//! Post-run output matching and scoring

use crate::template::Policy;
use crate::test::{Command, CommandStatus, ScoringMethod, StatusKind, Test, TestResult};
use tracing::debug;

/// True when every expected line appears in the output, in order. In a
/// secure run a trusted line must also carry its template's signer.
pub fn output_matches(cmd: &Command, secure: bool) -> bool {
    let mut cursor = 0;
    'expected: for exp in &cmd.expected {
        while cursor < cmd.output.len() {
            let got = &cmd.output[cursor];
            cursor += 1;
            if got.line != exp.text {
                continue;
            }
            if secure && exp.trusted && got.signer.as_deref() != Some(exp.key_name.as_str()) {
                continue;
            }
            continue 'expected;
        }
        return false;
    }
    true
}

/// Decide one command's status from its output and policies.
pub fn evaluate_command(cmd: &mut Command, secure: bool) {
    let policies_ok = cmd.panics.permits(cmd.panicked) && cmd.timesout.permits(cmd.timed_out);
    let expected_failure = (cmd.panics == Policy::Yes && cmd.panicked)
        || (cmd.timesout == Policy::Yes && cmd.timed_out);

    let correct = policies_ok && (expected_failure || output_matches(cmd, secure));
    cmd.status = if correct {
        CommandStatus::Correct
    } else {
        CommandStatus::Incorrect
    };
}

/// Whether the run's terminal status is acceptable given the last command
/// that ran.
fn status_acceptable(test: &Test) -> bool {
    let last = test.commands.iter().rev().find(|c| !c.synthetic || c.panicked);
    match test.terminal_status().map(|s| s.status) {
        Some(StatusKind::Shutdown) => true,
        Some(StatusKind::Timeout) => last.map_or(false, |c| {
            (c.timed_out && c.timesout != Policy::No) || (c.panicked && c.panics != Policy::No)
        }),
        Some(StatusKind::Crash) => last.map_or(false, |c| c.panicked && c.panics != Policy::No),
        _ => false,
    }
}

/// Score a completed run: evaluate commands, assign the result, compute
/// earned points and apply any memory-leak deduction.
pub fn score_test(test: &mut Test, secure: bool) {
    if test.result == TestResult::Skip {
        test.points_earned = 0;
        return;
    }

    for cmd in test.commands.iter_mut() {
        evaluate_command(cmd, secure);
        cmd.points_earned = if cmd.status == CommandStatus::Correct {
            cmd.points_available
        } else {
            0
        };
    }

    let aborted = test
        .commands
        .iter()
        .any(|c| c.panicked && c.panics == Policy::No);
    let all_correct = test
        .commands
        .iter()
        .all(|c| c.status == CommandStatus::Correct);

    test.result = if aborted {
        TestResult::Abort
    } else if all_correct && status_acceptable(test) {
        TestResult::Correct
    } else {
        TestResult::Incorrect
    };

    let earned = match test.scoring {
        ScoringMethod::Entire if test.result == TestResult::Correct => test.points_available,
        ScoringMethod::Entire => 0,
        ScoringMethod::Partial => test.body_commands().map(|c| c.points_earned).sum(),
    };
    test.points_earned = earned.min(test.points_available);

    test.mem_leak_deducted = 0;
    if test.mem_leak_points > 0 && test.mem_leak_bytes > 0 {
        let deducted = test.mem_leak_points.min(test.points_earned);
        test.mem_leak_deducted = deducted;
        test.points_earned -= deducted;
    }

    debug!(
        test = %test.dependency_id,
        result = %test.result,
        earned = test.points_earned,
        available = test.points_available,
        "scored test"
    );
}
