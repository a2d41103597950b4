use std::fmt::{self, Write};

use crate::cgroup::{CgroupStats, CpuLimit, format_bytes};
use crate::container::InspectReport;
use crate::registry::Container;

pub fn format_ps(containers: &[Container]) -> String {
    let mut out = String::from("CONTAINER ID\tPID\tSTATUS\tCOMMAND\n");
    for c in containers {
        out.push_str(&format!("{}\t{}\t{}\t{}\n", c.id, c.pid, c.status, c.command.join(" ")));
    }
    out
}

pub fn format_inspect(report: &InspectReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_inspect(&mut out, report);
    out
}

fn write_inspect(out: &mut String, report: &InspectReport) -> fmt::Result {
    let c = &report.container;
    let cgroup = c.cgroup.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
    writeln!(out, "Container Information:")?;
    writeln!(out, "  ID:        {}", c.id)?;
    writeln!(out, "  Status:    {}", c.status)?;
    writeln!(out, "  PID:       {}", c.pid)?;
    writeln!(out, "  Command:   {:?}", c.command)?;
    writeln!(out, "  RootFS:    {}", c.rootfs.display())?;
    writeln!(out, "  Cgroup:    {cgroup}")?;

    writeln!(out, "\nProcess Status:")?;
    writeln!(out, "  Running:   {}", if report.alive { "Yes" } else { "No" })?;
    if let Some(state) = &report.state {
        writeln!(out, "  State:     {state}")?;
    }
    if let Some(stats) = &report.cgroup {
        writeln!(out, "\nResource Limits:")?;
        write_stats(out, stats)?;
    }

    writeln!(out, "\nNamespaces:")?;
    if report.namespaces.is_empty() {
        writeln!(out, "  (process not running)")?;
    }
    for (name, target) in &report.namespaces {
        writeln!(out, "  {name}: {target}")?;
    }
    Ok(())
}

fn write_stats(out: &mut String, stats: &CgroupStats) -> fmt::Result {
    match stats.memory_limit {
        Some(None) => writeln!(out, "  Memory Limit:    unlimited")?,
        Some(Some(limit)) => writeln!(out, "  Memory Limit:    {limit} bytes ({})", format_bytes(limit))?,
        None => {}
    }
    if let Some(current) = stats.memory_current {
        writeln!(out, "  Memory Usage:    {current} bytes ({})", format_bytes(current))?;
    }
    if let Some(peak) = stats.memory_peak {
        writeln!(out, "  Memory Peak:     {peak} bytes ({})", format_bytes(peak))?;
    }
    match &stats.cpu_limit {
        Some(CpuLimit::Unlimited) => writeln!(out, "  CPU Quota:       unlimited")?,
        Some(limit @ CpuLimit::Quota { quota, period }) => writeln!(
            out,
            "  CPU Quota:       {quota}/{period} ({:.1}%)",
            limit.percent().unwrap_or(0.0)
        )?,
        None => {}
    }
    if let Some(usage) = stats.cpu_usage {
        writeln!(out, "  CPU Time:        {usage:?}")?;
    }
    if !stats.memory_events.is_empty() {
        writeln!(out, "\nMemory Events:")?;
        for (event, count) in &stats.memory_events {
            writeln!(out, "  {event}: {count}")?;
        }
    }
    if !stats.procs.is_empty() {
        writeln!(out, "\nProcesses in Cgroup: {}", stats.procs.len())?;
        for pid in &stats.procs {
            writeln!(out, "  PID: {pid}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContainerStatus;
    use std::time::Duration;

    fn report() -> InspectReport {
        let mut container = Container::new(
            "ab12cd34",
            vec!["/bin/sh".to_string()],
            "/tmp/cellbox/ab12cd34/rootfs",
        );
        container.status = ContainerStatus::Running;
        container.pid = 999;
        InspectReport {
            container,
            alive: true,
            state: Some("S (sleeping)".to_string()),
            cgroup: Some(CgroupStats {
                memory_limit: Some(Some(104857600)),
                memory_current: Some(1536),
                cpu_limit: Some(CpuLimit::Quota {
                    quota: 50000,
                    period: 100000,
                }),
                cpu_usage: Some(Duration::from_millis(250)),
                memory_events: vec![("oom_kill".to_string(), 2)],
                procs: vec![999],
                ..Default::default()
            }),
            namespaces: vec![("pid".to_string(), "pid:[4026532201]".to_string())],
        }
    }

    #[test]
    fn inspect_report_uses_human_units() {
        let text = format_inspect(&report());
        assert!(text.contains("Status:    running"));
        assert!(text.contains("Running:   Yes"));
        assert!(text.contains("State:     S (sleeping)"));
        assert!(text.contains("Memory Limit:    104857600 bytes (100.00 MB)"));
        assert!(text.contains("Memory Usage:    1536 bytes (1.50 KB)"));
        assert!(text.contains("CPU Quota:       50000/100000 (50.0%)"));
        assert!(text.contains("CPU Time:        250ms"));
        assert!(text.contains("oom_kill: 2"));
        assert!(text.contains("PID: 999"));
        assert!(text.contains("pid: pid:[4026532201]"));
    }

    #[test]
    fn ps_lists_one_row_per_container() {
        let text = format_ps(&[report().container]);
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], "ab12cd34\t999\trunning\t/bin/sh");
    }
}
