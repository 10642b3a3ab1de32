use std::path::PathBuf;
use std::time::Duration;

pub const NULL_DEVICE: &str = "/dev/null";
pub const ROOT_DIR: &str = "/";
pub const RUN_DIR: &str = "/var/run";

/// Handler slots, including the one reserved for the signal dispatcher.
pub const DEFAULT_HANDLER_CAPACITY: usize = 5;
pub const DEFAULT_TASK_CAPACITY: usize = 10;

/// Upper bound on how long a single poll may block.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Owner read/write, group and other read.
pub const PID_FILE_MODE: u32 = 0o644;

pub fn default_pid_file(program_name: &str) -> PathBuf {
    PathBuf::from(RUN_DIR).join(format!("{program_name}.pid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_defaults_under_run_dir() {
        assert_eq!(
            default_pid_file("demo"),
            PathBuf::from("/var/run/demo.pid")
        );
    }
}
