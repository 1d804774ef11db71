//! Plain-text formatting for timeline rows and summaries.

use swarmtrace_core::{EventDetails, EventStatus, FollowSummary, TimelineEvent};

/// Status glyph for a timeline row.
pub fn status_glyph(status: Option<EventStatus>) -> &'static str {
    match status {
        Some(EventStatus::Pending) => "·",
        Some(EventStatus::Running) => "…",
        Some(EventStatus::Success) => "✓",
        Some(EventStatus::Error) => "✗",
        None => " ",
    }
}

/// One line per event, children indented beneath it.
pub fn timeline_lines(event: &TimelineEvent) -> Vec<String> {
    let mut lines = vec![event_line(event)];
    for child in &event.children {
        let text = match &child.details {
            Some(EventDetails::Output { text, .. }) => text.as_str(),
            _ => child.title.as_str(),
        };
        lines.push(format!("    └ {}", truncate_preview(text, 60)));
    }
    lines
}

pub fn event_line(event: &TimelineEvent) -> String {
    let mut line = format!(
        "{} {:<8} {}",
        status_glyph(event.status),
        event.kind.as_str(),
        event.title
    );
    if let Some(agent) = &event.agent {
        line.push_str(&format!("  [{}]", agent));
    }
    if let Some(ms) = event.duration_ms {
        line.push_str(&format!("  {}", format_duration_ms(ms)));
    }
    if let Some(description) = &event.description {
        line.push_str(&format!("\n    {}", truncate_preview(description, 80)));
    }
    line
}

pub fn format_duration_ms(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

pub fn print_summary(summary: &FollowSummary) {
    println!();
    println!("Follow finished: {}", summary.outcome);
    println!("  Offset:          {}", summary.offset);
    println!(
        "  Run status:      {}",
        summary.status.map(|s| s.as_str()).unwrap_or("unknown")
    );
    println!("  Chunks:          {}", summary.chunks);
    println!("  Messages:        {}", summary.messages);
    println!("  Persisted:       {}", summary.persisted);
    println!("  Timeline events: {}", summary.timeline_events);
}

fn truncate_preview(input: &str, max_chars: usize) -> String {
    let first_line = input.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars && first_line.len() == input.len() {
        return input.to_string();
    }
    let cut: String = first_line.chars().take(max_chars).collect();
    format!("{}…", cut)
}
