//! `ps` output normalization
//!
//! Parses the columns requested by [`PS_COLUMNS`] into [`ProcessSample`]s.
//! Kept platform-neutral so the parser is tested everywhere.

use crate::core::models::{ProcessSample, ProcessStatus};

/// Column list passed to `ps -o`; the command name goes last since it may contain spaces
pub const PS_COLUMNS: &str = "pid=,ppid=,stat=,etime=,pcpu=,rss=,pmem=,comm=";

const DEFUNCT_SUFFIX: &str = "<defunct>";

/// Parse an `etime` value: `[[dd-]hh:]mm:ss`
pub fn parse_elapsed(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().ok()?, clock),
        None => (0, value),
    };

    let fields: Vec<u64> = clock
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let (hours, minutes, seconds) = match fields.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    Some(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}

/// Map a procps/BSD `stat` code onto the normalized status
pub fn parse_state_code(code: &str) -> ProcessStatus {
    match code.trim().chars().next() {
        Some('R') => ProcessStatus::Running,
        Some('S') | Some('D') | Some('I') | Some('U') | Some('W') => ProcessStatus::Sleeping,
        Some('Z') => ProcessStatus::Zombie,
        Some('T') | Some('t') => ProcessStatus::Stopped,
        _ => ProcessStatus::Unknown,
    }
}

/// Parse one `ps` row; `None` for malformed rows and for pid 0
pub fn parse_ps_line(line: &str) -> Option<ProcessSample> {
    let mut parts = line.split_whitespace();
    let pid: u32 = parts.next()?.parse().ok()?;
    let ppid: u32 = parts.next()?.parse().ok()?;
    let status = parse_state_code(parts.next()?);
    let elapsed_secs = parse_elapsed(parts.next()?)?;
    let cpu_usage: f64 = parts.next()?.parse().ok()?;
    let rss_kib: u64 = parts.next()?.parse().ok()?;
    let memory_percent: f64 = parts.next()?.parse().ok()?;

    let name = parts.collect::<Vec<_>>().join(" ");
    let name = name.trim_end_matches(DEFUNCT_SUFFIX).trim();
    if pid == 0 || name.is_empty() {
        return None;
    }

    Some(
        ProcessSample::new(pid, ppid, name, status)
            .with_elapsed_secs(elapsed_secs)
            .with_cpu_usage(cpu_usage)
            .with_memory(rss_kib.saturating_mul(1024), memory_percent),
    )
}

/// Parse a full listing, returning the samples and the number of skipped rows
pub fn parse_ps_output(output: &str) -> (Vec<ProcessSample>, usize) {
    let mut samples = Vec::new();
    let mut skipped = 0;
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        match parse_ps_line(line) {
            Some(sample) => samples.push(sample),
            None => skipped += 1,
        }
    }
    (samples, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn elapsed_formats() {
        assert_eq!(parse_elapsed("00:07"), Some(7));
        assert_eq!(parse_elapsed("12:34"), Some(754));
        assert_eq!(parse_elapsed("01:00:00"), Some(3_600));
        assert_eq!(parse_elapsed("3-04:05:06"), Some(3 * 86_400 + 4 * 3_600 + 5 * 60 + 6));
        assert_eq!(parse_elapsed(""), None);
        assert_eq!(parse_elapsed("1:2:3:4"), None);
        assert_eq!(parse_elapsed("aa:bb"), None);
        assert_eq!(parse_elapsed("10:75"), None);
    }

    #[test]
    fn state_codes() {
        assert_eq!(parse_state_code("R+"), ProcessStatus::Running);
        assert_eq!(parse_state_code("Ss"), ProcessStatus::Sleeping);
        assert_eq!(parse_state_code("D"), ProcessStatus::Sleeping);
        assert_eq!(parse_state_code("Z+"), ProcessStatus::Zombie);
        assert_eq!(parse_state_code("T"), ProcessStatus::Stopped);
        assert_eq!(parse_state_code("X"), ProcessStatus::Unknown);
    }

    #[test]
    fn parses_row_with_spaces_in_name() {
        let sample = parse_ps_line("  4242   100 S    1-00:00:01  0.0 20480  1.2 Google Chrome Helper")
            .expect("row should parse");
        assert_eq!(sample.pid, 4242);
        assert_eq!(sample.ppid, 100);
        assert_eq!(sample.name, "Google Chrome Helper");
        assert_eq!(sample.elapsed_secs, 86_401);
        assert_eq!(sample.memory_bytes, 20480 * 1024);
        assert_eq!(sample.status, ProcessStatus::Sleeping);
    }

    #[test]
    fn strips_defunct_marker() {
        let sample = parse_ps_line("500 1 Z 05:00 0.0 0 0.0 node <defunct>").unwrap();
        assert_eq!(sample.name, "node");
        assert_eq!(sample.status, ProcessStatus::Zombie);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let output = "\
    1     0 Ss   10:00  0.0  1000  0.1 init
  abc     1 S    00:01  0.0   100  0.0 broken
  300     1 S    bogus  0.0   100  0.0 broken-etime
    0     0 R    00:01  0.0     0  0.0 kernel_task
  301     1 R    00:02  5.5   200  0.0 worker
";
        let (samples, skipped) = parse_ps_output(output);
        let pids: Vec<u32> = samples.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![1, 301]);
        assert_eq!(skipped, 3);
    }
}
