//! Terminal output for search results, statistics and index status

use crate::index::stats::{StatisticsResult, Statistic};
use crate::index::types::SearchResult;
use crate::service::{FailedTask, IndexStatus};
use std::io::{self, Write};
use std::path::Path;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn stdout(color: bool) -> StandardStream {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    StandardStream::stdout(choice)
}

/// Print search results grouped by document, with the match highlighted
/// between its contexts
pub fn print_results(results: &[SearchResult], color: bool) -> io::Result<()> {
    write_results(&mut stdout(color), results)
}

pub fn write_results<W: WriteColor>(out: &mut W, results: &[SearchResult]) -> io::Result<()> {
    let mut current_doc = None;

    for r in results {
        if current_doc != Some(r.document_id) {
            if current_doc.is_some() {
                writeln!(out)?;
            }
            out.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)).set_bold(true))?;
            writeln!(out, "{}", r.document_title)?;
            out.reset()?;
            current_doc = Some(r.document_id);
        }

        out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        write!(out, "{}-{}", r.offset_start, r.offset_end)?;
        out.reset()?;
        write!(out, ":")?;

        write!(out, "{}", one_line(&r.left_context))?;
        if r.text.is_empty() {
            // Structural hit on an empty span
            out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
            write!(out, "<>")?;
        } else {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true))?;
            write!(out, "{}", one_line(&r.text))?;
        }
        out.reset()?;
        writeln!(out, "{}", one_line(&r.right_context))?;
    }

    Ok(())
}

fn one_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

/// Print a statistics table, one row per metric
pub fn print_statistics(result: &StatisticsResult, color: bool) -> io::Result<()> {
    write_statistics(&mut stdout(color), result)
}

pub fn write_statistics<W: WriteColor>(out: &mut W, result: &StatisticsResult) -> io::Result<()> {
    let stats: Vec<Statistic> = result.statistics.iter().copied().collect();
    let name_width = result
        .results
        .keys()
        .map(|k| k.chars().count())
        .max()
        .unwrap_or(0)
        .max("Metric".len());

    out.set_color(ColorSpec::new().set_bold(true))?;
    write!(out, "{:<width$}", "Metric", width = name_width)?;
    for stat in &stats {
        write!(out, "  {:>12}", stat.name())?;
    }
    writeln!(out)?;
    out.reset()?;

    for (name, metric) in &result.results {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(out, "{:<width$}", name, width = name_width)?;
        out.reset()?;
        for stat in &stats {
            write!(out, "  {:>12}", format_value(metric.get(*stat)))?;
        }
        if let Some(hits) = metric.hits() {
            write!(out, "  ({} hits)", hits as u64)?;
        }
        writeln!(out)?;
    }

    writeln!(out)?;
    write!(out, "{} documents", result.documents)?;
    match (result.min_tokens_per_doc, result.max_tokens_per_doc) {
        (None, None) => {}
        (min, max) => {
            let bound = |b: Option<u32>| b.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string());
            write!(out, " with {}..{} tokens", bound(min), bound(max))?;
        }
    }
    writeln!(out)
}

fn format_value(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.is_nan() => "-".to_string(),
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{:.4}", v),
    }
}

/// Print the state of a project index
pub fn print_status(
    status: &IndexStatus,
    failed: &[FailedTask],
    name_of: impl Fn(u64) -> Option<String>,
    color: bool,
) -> io::Result<()> {
    let mut out = stdout(color);

    out.set_color(ColorSpec::new().set_bold(true))?;
    writeln!(out, "Index: {}", status.index_path.display())?;
    out.reset()?;

    let size = dir_size(&status.index_path).unwrap_or(0);
    writeln!(out, "  Segments:  {}", status.segments)?;
    writeln!(out, "  Size:      {}", format_size(size))?;
    writeln!(out, "  Valid:     {}", status.valid)?;
    writeln!(out, "  Pending:   {}", status.pending)?;
    if status.invalid > 0 {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
    }
    writeln!(out, "  Failed:    {}", status.invalid)?;
    out.reset()?;

    for task in failed {
        let name = name_of(task.doc).unwrap_or_else(|| format!("#{}", task.doc));
        writeln!(out, "    {} ({}): {}", name, task.variant, task.cause)?;
    }
    Ok(())
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() {
                size += entry.metadata()?.len();
            } else if path.is_dir() {
                size += dir_size(&path)?;
            }
        }
    }
    Ok(size)
}

/// Format byte size to human readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
