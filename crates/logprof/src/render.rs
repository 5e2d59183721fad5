//! Rendering of aggregated groups and diffs as TSV or JSON

use anyhow::{bail, Result};
use logprof_stats::{
    format_count_delta, format_delta, DiffEntry, HttpStat, MetricBlock, MetricDelta, Presence,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

/// Digits after the decimal point for metric values
const PRECISION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Tsv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tsv" => Ok(OutputFormat::Tsv),
            "json" => Ok(OutputFormat::Json),
            other => bail!("unknown output format: {}", other),
        }
    }
}

fn header(percentiles: &[u8]) -> Vec<String> {
    let mut columns: Vec<String> = ["COUNT", "1XX", "2XX", "3XX", "4XX", "5XX", "METHOD", "URI"]
        .into_iter()
        .map(String::from)
        .collect();
    columns.extend(["MIN", "MAX", "SUM", "AVG"].map(String::from));
    columns.extend(percentiles.iter().map(|p| format!("P{p}")));
    columns.push("STDDEV".to_string());
    columns.extend(["MIN(BODY)", "MAX(BODY)", "SUM(BODY)", "AVG(BODY)"].map(String::from));
    columns
}

fn write_row<W: Write>(out: &mut W, fields: &[String]) -> Result<()> {
    writeln!(out, "{}", fields.join("\t"))?;
    Ok(())
}

fn fixed(value: f64) -> String {
    format!("{:.*}", PRECISION, value)
}

/// Derived values of one metric block
#[derive(Debug, Serialize)]
struct Summary {
    min: f64,
    max: f64,
    sum: f64,
    avg: f64,
    stddev: f64,
    percentiles: BTreeMap<String, f64>,
}

impl Summary {
    fn new(block: &MetricBlock, count: i64, percentiles: &[u8]) -> Self {
        Self {
            min: block.min,
            max: block.max,
            sum: block.sum,
            avg: block.avg(count),
            stddev: block.stddev(count),
            percentiles: percentiles
                .iter()
                .map(|p| (format!("p{p}"), block.percentile(count, *p)))
                .collect(),
        }
    }

    fn from_delta(delta: &MetricDelta) -> Self {
        Self {
            min: delta.min,
            max: delta.max,
            sum: delta.sum,
            avg: delta.avg,
            stddev: delta.stddev,
            percentiles: delta
                .percentiles
                .iter()
                .map(|(p, d)| (format!("p{p}"), *d))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatRow<'a> {
    method: &'a str,
    uri: &'a str,
    count: i64,
    status1xx: i64,
    status2xx: i64,
    status3xx: i64,
    status4xx: i64,
    status5xx: i64,
    response_time: Summary,
    request_body_bytes: Summary,
    response_body_bytes: Summary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum PresenceLabel {
    Both,
    Added,
    Removed,
}

impl From<Presence> for PresenceLabel {
    fn from(presence: Presence) -> Self {
        match presence {
            Presence::Both => PresenceLabel::Both,
            Presence::Added => PresenceLabel::Added,
            Presence::Removed => PresenceLabel::Removed,
        }
    }
}

#[derive(Debug, Serialize)]
struct DiffRow<'a> {
    method: &'a str,
    uri: &'a str,
    presence: PresenceLabel,
    count: i64,
    status1xx: i64,
    status2xx: i64,
    status3xx: i64,
    status4xx: i64,
    status5xx: i64,
    response_time: Summary,
    request_body_bytes: Summary,
    response_body_bytes: Summary,
}

/// Write aggregated groups in their current order
pub fn render_stats<W: Write>(
    out: &mut W,
    stats: &[HttpStat],
    percentiles: &[u8],
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<StatRow<'_>> = stats
                .iter()
                .map(|stat| StatRow {
                    method: &stat.method,
                    uri: &stat.uri,
                    count: stat.count,
                    status1xx: stat.status1xx,
                    status2xx: stat.status2xx,
                    status3xx: stat.status3xx,
                    status4xx: stat.status4xx,
                    status5xx: stat.status5xx,
                    response_time: Summary::new(&stat.response_time, stat.count, percentiles),
                    request_body_bytes: Summary::new(
                        &stat.request_body_bytes,
                        stat.count,
                        percentiles,
                    ),
                    response_body_bytes: Summary::new(
                        &stat.response_body_bytes,
                        stat.count,
                        percentiles,
                    ),
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &rows)?;
            writeln!(out)?;
        }
        OutputFormat::Tsv => {
            write_row(out, &header(percentiles))?;
            for stat in stats {
                let rt = &stat.response_time;
                let body = &stat.response_body_bytes;
                let mut fields = vec![
                    stat.count.to_string(),
                    stat.status1xx.to_string(),
                    stat.status2xx.to_string(),
                    stat.status3xx.to_string(),
                    stat.status4xx.to_string(),
                    stat.status5xx.to_string(),
                    stat.method.clone(),
                    stat.uri.clone(),
                    fixed(rt.min),
                    fixed(rt.max),
                    fixed(rt.sum),
                    fixed(rt.avg(stat.count)),
                ];
                fields.extend(percentiles.iter().map(|p| fixed(rt.percentile(stat.count, *p))));
                fields.push(fixed(rt.stddev(stat.count)));
                fields.extend([
                    fixed(body.min),
                    fixed(body.max),
                    fixed(body.sum),
                    fixed(body.avg(stat.count)),
                ]);
                write_row(out, &fields)?;
            }
        }
    }
    Ok(())
}

/// Write diff entries with explicit signs
pub fn render_diff<W: Write>(
    out: &mut W,
    entries: &[DiffEntry],
    percentiles: &[u8],
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<DiffRow<'_>> = entries
                .iter()
                .map(|entry| DiffRow {
                    method: &entry.method,
                    uri: &entry.uri,
                    presence: entry.presence.into(),
                    count: entry.count,
                    status1xx: entry.status1xx,
                    status2xx: entry.status2xx,
                    status3xx: entry.status3xx,
                    status4xx: entry.status4xx,
                    status5xx: entry.status5xx,
                    response_time: Summary::from_delta(&entry.response_time),
                    request_body_bytes: Summary::from_delta(&entry.request_body_bytes),
                    response_body_bytes: Summary::from_delta(&entry.response_body_bytes),
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &rows)?;
            writeln!(out)?;
        }
        OutputFormat::Tsv => {
            let mut columns = header(percentiles);
            columns.push("DIFF".to_string());
            write_row(out, &columns)?;

            let signed = |d: f64| format_delta(d, PRECISION);
            for entry in entries {
                let rt = &entry.response_time;
                let body = &entry.response_body_bytes;
                let mut fields = vec![
                    format_count_delta(entry.count),
                    format_count_delta(entry.status1xx),
                    format_count_delta(entry.status2xx),
                    format_count_delta(entry.status3xx),
                    format_count_delta(entry.status4xx),
                    format_count_delta(entry.status5xx),
                    entry.method.clone(),
                    entry.uri.clone(),
                    signed(rt.min),
                    signed(rt.max),
                    signed(rt.sum),
                    signed(rt.avg),
                ];
                fields.extend(rt.percentiles.iter().map(|(_, d)| signed(*d)));
                fields.push(signed(rt.stddev));
                fields.extend([
                    signed(body.min),
                    signed(body.max),
                    signed(body.sum),
                    signed(body.avg),
                ]);
                fields.push(
                    match entry.presence {
                        Presence::Both => "",
                        Presence::Added => "added",
                        Presence::Removed => "removed",
                    }
                    .to_string(),
                );
                write_row(out, &fields)?;
            }
        }
    }
    Ok(())
}
