//! Line parser for the engine's intermediate reports.
//!
//! A report looks like
//! `[ 10s ] thds: 8 tps: 1021.45 qps: 20429.02 (r/w/o: 14300.31/4085.81/2042.90) lat (ms,95%): 12.08 err/s: 0.00 reconn/s: 0.00`.
//! Parsing is per line and never fails the run: lines that look like reports
//! but do not parse are counted as malformed, everything else is ignored.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
    pub elapsed_secs: u64,
    pub threads: u64,
    pub tps: f64,
    pub qps: f64,
    /// Percentile label (`"95"`) and latency in milliseconds.
    pub latency: Option<(String, f64)>,
    pub errors_per_sec: f64,
    pub reconnects_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Report(EngineReport),
    Malformed,
    Other,
}

#[must_use]
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('[') else {
        return ParsedLine::Other;
    };
    let Some((elapsed, body)) = rest.split_once(']') else {
        return ParsedLine::Other;
    };
    if !body.contains("thds:") {
        return ParsedLine::Other;
    }
    parse_report(elapsed, body).map_or(ParsedLine::Malformed, ParsedLine::Report)
}

fn parse_report(elapsed: &str, body: &str) -> Option<EngineReport> {
    let elapsed_secs = elapsed.trim().strip_suffix('s')?.trim().parse().ok()?;
    Some(EngineReport {
        elapsed_secs,
        threads: value_after(body, "thds")?.parse().ok()?,
        tps: parse_float(value_after(body, "tps")?)?,
        qps: parse_float(value_after(body, "qps")?)?,
        latency: parse_latency(body),
        errors_per_sec: value_after(body, "err/s").map_or(Some(0.0), parse_float)?,
        reconnects_per_sec: value_after(body, "reconn/s").map_or(Some(0.0), parse_float)?,
    })
}

/// First token after `key`, with an optional `:` separator.
fn value_after<'line>(body: &'line str, key: &str) -> Option<&'line str> {
    let start = body.find(key)?.checked_add(key.len())?;
    body.get(start..)?
        .trim_start()
        .trim_start_matches(':')
        .split_whitespace()
        .next()
}

fn parse_float(token: &str) -> Option<f64> {
    let value: f64 = token.trim_end_matches(',').parse().ok()?;
    value.is_finite().then_some(value)
}

fn parse_latency(body: &str) -> Option<(String, f64)> {
    let start = body.find("lat (ms,")?.checked_add("lat (ms,".len())?;
    let tail = body.get(start..)?;
    let (label, rest) = tail.split_once("%):")?;
    let label = label.trim();
    if label.is_empty() || !label.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
        return None;
    }
    let value = parse_float(rest.split_whitespace().next()?)?;
    Some((label.to_owned(), value))
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl TailBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_owned());
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
