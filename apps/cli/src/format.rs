use std::time::{Duration, SystemTime};

use console::style;
use telespool_core::{EventRecord, FlushReport};

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

/// Age of a wall-clock timestamp relative to now.
pub fn format_age(t: SystemTime) -> String {
    let age = SystemTime::now().duration_since(t).unwrap_or_default();
    format!("{} ago", format_duration(age))
}

pub fn format_record(record: &EventRecord) -> String {
    let value = record
        .headline()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>6}  {:<12} {:<40} {:>10}  {}",
        style(record.id).dim(),
        style(record.category).yellow(),
        record.key,
        value,
        style(format_age(record.created_at)).dim()
    )
}

pub fn format_flush(report: &FlushReport, elapsed: Duration) -> String {
    let mark = if report.is_complete() {
        style("✓").green().bold()
    } else {
        style("!").yellow().bold()
    };
    let mut line = format!(
        "{} Flushed {} batch(es), {} acknowledged",
        mark, report.batches, report.acknowledged
    );
    if report.requeued > 0 {
        line.push_str(&format!(
            ", {}",
            style(format!("{} left for retry", report.requeued)).yellow()
        ));
    }
    line.push_str(&format!(
        " {}",
        style(format!("[{}]", format_duration(elapsed))).dim()
    ));
    line
}
