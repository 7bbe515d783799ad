//! Shell-script worker commands.
//!
//! Each helper returns a command builder running `sh -c <script>` with the
//! partition bounds as `$1` and `$2`. The supervisor also exports
//! `FANOUT_WORKER_ID` and `FANOUT_ATTEMPT`, which scripts can branch on.

use crate::executor::{CommandBuilder, WorkerState};

/// Runs `script` with `sh`, passing `start` and `end` as positional arguments.
pub fn sh_worker(script: impl Into<String>) -> impl CommandBuilder + Clone + 'static {
    let script = script.into();
    move |state: &WorkerState| {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.clone(),
            "sh".to_string(),
            state.partition.start_index.to_string(),
            state.partition.end_index.to_string(),
        ]
    }
}

/// Reports a couple of progress steps, then success.
pub const HAPPY_SCRIPT: &str = r#"
total=$(($2 - $1))
echo "STATUS: RUNNING"
echo "MESSAGE: Processing records $1..$2"
echo "working on $1"
echo "PROGRESS: $((total / 2))"
echo "PROGRESS: $total"
echo "STATUS: SUCCESS"
"#;

/// Prints two log lines, a stderr line and some protocol lines, then exits 1.
pub const FAILING_SCRIPT: &str = r#"
echo "STATUS: RUNNING"
echo "This is an unrecognized log line 1"
echo "This is an unrecognized log line 2"
echo "This is an error in stderr" >&2
echo "PROGRESS: 5"
exit 1
"#;

/// Fails its first attempt and succeeds on every later one.
pub const FLAKY_SCRIPT: &str = r#"
echo "STATUS: RUNNING"
if [ "$FANOUT_ATTEMPT" = "1" ]; then
  echo "PROGRESS: 1"
  echo "first attempt fails"
  exit 3
fi
echo "PROGRESS: $(($2 - $1))"
echo "STATUS: SUCCESS"
"#;

/// Prints nothing and exits cleanly.
pub const SILENT_SCRIPT: &str = "exit 0";

/// Reports that it started, then never finishes.
pub const HANGING_SCRIPT: &str = r#"
echo "STATUS: RUNNING"
exec sleep 600
"#;

/// Command that cannot be launched.
pub fn missing_program() -> impl CommandBuilder + Clone + 'static {
    |_: &WorkerState| vec!["/nonexistent/fanout-worker".to_string()]
}
