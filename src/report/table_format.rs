//! ASCII table formatting for scan, analysis and cleanup results.

use prettytable::{format, Cell, Row, Table};

use crate::core::models::{CleanupOperation, ProcessInfo, ZombieProcessInfo};

/// Safely truncate a string to at most `max_chars` characters (not bytes),
/// appending "..." if truncated.
fn truncate_str(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{truncated}...")
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(headers.iter().map(|h| Cell::new(h)).collect()));
    table
}

/// Format a process snapshot as an ASCII table.
pub fn format_processes_table(processes: &[ProcessInfo]) -> String {
    if processes.is_empty() {
        return "No processes found.".to_string();
    }

    let mut table = new_table(&["PID", "PPID", "NAME", "STATUS", "CPU%", "MEMORY", "ZOMBIE"]);
    for p in processes {
        let zombie = if p.is_zombie { "✓" } else { "" };
        table.add_row(Row::new(vec![
            Cell::new(&p.pid.to_string()),
            Cell::new(&p.ppid.to_string()),
            Cell::new(&truncate_str(&p.name, 32)),
            Cell::new(p.status.as_str()),
            Cell::new(&format!("{:.1}", p.cpu_usage)),
            Cell::new(&format_bytes(p.memory_usage)),
            Cell::new(zombie),
        ]));
    }

    table.to_string()
}

/// Format confirmed zombies as an ASCII table.
pub fn format_zombies_table(zombies: &[ZombieProcessInfo]) -> String {
    if zombies.is_empty() {
        return "No zombie processes confirmed.".to_string();
    }

    let mut table = new_table(&[
        "PID",
        "NAME",
        "CONFIDENCE",
        "METHODS",
        "RESOURCE",
        "SYSTEM",
        "FIRST_DETECTED",
        "CLEANUP",
    ]);
    for z in zombies {
        let methods = z
            .detection_methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",");
        table.add_row(Row::new(vec![
            Cell::new(&z.pid().to_string()),
            Cell::new(&truncate_str(&z.process.name, 24)),
            Cell::new(&format!("{:.3}", z.zombie_confidence)),
            Cell::new(&methods),
            Cell::new(z.resource_impact.as_str()),
            Cell::new(z.system_impact.as_str()),
            Cell::new(&z.first_detected.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(z.cleanup_status.as_str()),
        ]));
    }

    table.to_string()
}

/// Format cleanup operations as an ASCII table.
pub fn format_cleanups_table(operations: &[CleanupOperation]) -> String {
    if operations.is_empty() {
        return "No cleanup operations.".to_string();
    }

    let mut table = new_table(&[
        "OPERATION",
        "PID",
        "NAME",
        "PRIORITY",
        "STATUS",
        "ATTEMPTS",
        "FREED",
        "DURATION",
    ]);
    for op in operations {
        let duration = op
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(Row::new(vec![
            Cell::new(&op.operation_id[..op.operation_id.len().min(8)]),
            Cell::new(&op.pid.to_string()),
            Cell::new(&truncate_str(&op.process_name, 24)),
            Cell::new(op.priority.as_str()),
            Cell::new(op.status.as_str()),
            Cell::new(&op.attempts.to_string()),
            Cell::new(&format_bytes(op.resources_freed)),
            Cell::new(&duration),
        ]));
    }

    table.to_string()
}
