//! Plain-text rendering of API responses.

use recodex_daemon::service::{ConfigReport, StatusReport, WorkersReport};
use recodex_daemon::{RecordView, StatisticsReport, WorkerState};

/// Human-readable byte count, e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn job_line(view: &RecordView) -> String {
    let record = &view.record;
    let mut line = format!(
        "#{:<5} {:<9} {:<14} {}",
        record.id,
        record.status.to_string(),
        record.profile_name,
        record.source.display()
    );
    if let Some(saved) = view.space_saved {
        line.push_str(&format!(
            "  saved {} ({})",
            format_bytes(saved),
            optional(view.space_saved_percentage.map(|p| format!("{:.1}%", p)))
        ));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!("  error: {}", error));
    }
    line
}

pub fn job_detail(view: &RecordView) -> String {
    let r = &view.record;
    [
        format!("id:            {}", r.id),
        format!("status:        {}", r.status),
        format!("source:        {}", r.source.display()),
        format!("destination:   {}", r.destination.display()),
        format!("profile:       {} ({})", r.profile_name, r.profile_key),
        format!("codec:         {}", optional(r.video_codec.as_deref())),
        format!("original size: {}", optional(r.original_size.map(format_bytes))),
        format!("final size:    {}", optional(r.final_size.map(format_bytes))),
        format!("ratio:         {}", optional(view.compression_ratio.map(|c| format!("{:.2}", c)))),
        format!("processing:    {}", optional(r.processing_secs.map(|s| format!("{:.1}s", s)))),
        format!("hardware:      {}", r.hardware_accel_used),
        format!("error:         {}", optional(r.error.as_deref())),
    ]
    .join("\n")
}

pub fn stats_text(report: &StatisticsReport) -> String {
    let mut lines = vec![
        format!("completed:        {}", report.total_completed),
        format!("pending/running:  {}/{}", report.pending, report.running),
        format!("failed:           {}", report.failed),
        format!("queued:           {}", report.queue_depth),
        format!("original total:   {}", format_bytes(report.total_original_size)),
        format!("space saved:      {}", format_bytes(report.total_space_saved)),
        format!(
            "avg ratio:        {}",
            optional(report.average_compression_ratio.map(|r| format!("{:.2}", r)))
        ),
        format!(
            "avg processing:   {}",
            optional(report.average_processing_secs.map(|s| format!("{:.1}s", s)))
        ),
    ];

    if !report.by_profile.is_empty() {
        lines.push(String::new());
        lines.push("by profile:".to_string());
        for (name, group) in &report.by_profile {
            lines.push(format!(
                "  {:<16} {:>5} jobs  saved {}",
                name,
                group.completed,
                format_bytes(group.total_space_saved)
            ));
        }
    }
    if !report.by_codec.is_empty() {
        lines.push(String::new());
        lines.push("by codec:".to_string());
        for (codec, group) in &report.by_codec {
            lines.push(format!(
                "  {:<16} {:>5} jobs  saved {}",
                codec,
                group.completed,
                format_bytes(group.total_space_saved)
            ));
        }
    }
    if !report.top_space_savers.is_empty() {
        lines.push(String::new());
        lines.push("top space savers:".to_string());
        for view in &report.top_space_savers {
            lines.push(format!("  {}", job_line(view)));
        }
    }
    lines.join("\n")
}

pub fn workers_text(report: &WorkersReport) -> String {
    let mut lines: Vec<String> = report
        .workers
        .iter()
        .map(|w| match w.state {
            WorkerState::Idle => format!("worker {}: idle", w.worker_id),
            WorkerState::Processing => format!(
                "worker {}: job #{} {:>5.1}% {}",
                w.worker_id,
                optional(w.record_id),
                w.progress,
                w.source
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
        })
        .collect();
    lines.push(format!("queued: {}", report.queue_depth));
    lines.join("\n")
}

pub fn config_text(report: &ConfigReport) -> String {
    let mut lines = vec!["profiles:".to_string()];
    for (key, profile) in &report.profiles {
        lines.push(format!(
            "  {:<14} {:<14} video {:<5} audio {:<5} .{:<4} hw {}",
            key,
            profile.name,
            profile.video_codec,
            profile.audio_codec,
            profile.container,
            if profile.hardware_accel { "yes" } else { "no" }
        ));
    }

    lines.push(String::new());
    if report.watch.is_empty() {
        lines.push("no watch folders configured".to_string());
    } else {
        lines.push("watch folders:".to_string());
        for target in &report.watch {
            lines.push(format!(
                "  {} -> {}{}  [{}]",
                target.path.display(),
                target.profile,
                if target.recursive { " (recursive)" } else { "" },
                target.extensions.join(" ")
            ));
        }
    }
    lines.join("\n")
}

pub fn status_text(report: &StatusReport) -> String {
    let busy = report
        .workers
        .iter()
        .filter(|w| w.state == WorkerState::Processing)
        .count();
    let mut lines = vec![
        format!("uptime:    {}s", report.uptime_secs),
        format!("mode:      {}", if report.dry_run { "dry run" } else { "live" }),
        format!(
            "watching:  {} of {} folders",
            report.watching.len(),
            report.watch_targets
        ),
    ];
    lines.extend(report.watching.iter().map(|p| format!("  {}", p.display())));
    lines.push(format!("workers:   {} busy / {}", busy, report.workers.len()));
    lines.push(format!("queued:    {}", report.queue_depth));
    lines.push(format!(
        "jobs:      {} pending, {} running, {} completed, {} failed",
        report.jobs.pending, report.jobs.running, report.jobs.completed, report.jobs.failed
    ));
    lines.join("\n")
}
