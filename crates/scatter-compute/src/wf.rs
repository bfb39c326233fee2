//! Word frequency over a set of UTF-8 text documents.
//!
//! Arguments are file glob patterns (`?`, `*`, `**`, `[]`); partitioning
//! expands them and splits each matched document into blank-line separated
//! paragraphs, one paragraph per partial input. Partial outputs are
//! JSON-encoded word→count maps, so every message is independently
//! decodable.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::computation::{ArgumentError, BinaryData, Computation, ComputeRequest};

pub struct WordFrequency {
    request: Option<ComputeRequest>,
    counts: HashMap<String, u64>,
    files: Arc<AtomicUsize>,
}

impl WordFrequency {
    pub fn new() -> Self {
        Self {
            request: None,
            counts: HashMap::new(),
            files: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for WordFrequency {
    fn default() -> Self {
        Self::new()
    }
}

impl Computation for WordFrequency {
    fn name(&self) -> &'static str {
        "wf"
    }

    fn description(&self) -> &'static str {
        "computes the frequency of occurrence of words in a set of UTF-8 text documents"
    }

    fn partition(
        &mut self,
        request: ComputeRequest,
    ) -> Result<mpsc::Receiver<BinaryData>, ArgumentError> {
        if request.args.is_empty() {
            return Err(ArgumentError::new(
                "specify file globs (with ?, *, **, []), e.g. f?o/**/bar-*.txt",
            ));
        }

        let patterns = request.args.clone();
        let sink = request.output.clone();
        self.request = Some(request);
        self.counts = HashMap::new();
        self.files = Arc::new(AtomicUsize::new(0));
        let files = self.files.clone();

        // Buffered so reading ahead of dispatch is bounded.
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            for pattern in patterns {
                let paths = match glob::glob(&pattern) {
                    Ok(paths) => paths,
                    Err(_) => {
                        let mut sink = sink.clone();
                        let _ = writeln!(sink, "Skipping bad file glob pattern: {pattern}");
                        continue;
                    }
                };
                let mut matched = false;
                for entry in paths {
                    let path = match entry {
                        Ok(path) => path,
                        Err(e) => {
                            let mut sink = sink.clone();
                            let _ = writeln!(sink, "Skipping unreadable path: {e}");
                            continue;
                        }
                    };
                    matched = true;
                    // Every matched path counts, readable or not.
                    files.fetch_add(1, Ordering::Relaxed);
                    let text = match tokio::fs::read_to_string(&path).await {
                        Ok(text) => text,
                        Err(e) => {
                            let mut sink = sink.clone();
                            let _ =
                                writeln!(sink, "Skipping unreadable file {}: {e}", path.display());
                            continue;
                        }
                    };
                    for paragraph in split_paragraphs(&text) {
                        if tx.send(Bytes::from(paragraph)).await.is_err() {
                            return;
                        }
                    }
                }
                if !matched {
                    let mut sink = sink.clone();
                    let _ = writeln!(sink, "No matches for file glob pattern: {pattern}");
                }
            }
        });

        Ok(rx)
    }

    fn partial_compute(&self, input: &BinaryData) -> Option<BinaryData> {
        let Ok(text) = std::str::from_utf8(input) else {
            return Some(Bytes::new()); // encoding error, coordinator fails fast
        };
        let frequency = word_frequency(text);
        match serde_json::to_vec(&frequency) {
            Ok(encoded) => Some(Bytes::from(encoded)),
            Err(_) => Some(Bytes::new()),
        }
    }

    fn partial_compute_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn accumulate(&mut self, output: BinaryData) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        match serde_json::from_slice::<HashMap<String, u64>>(&output) {
            Ok(frequency) => {
                for (word, count) in frequency {
                    *self.counts.entry(word).or_insert(0) += count;
                }
            }
            Err(e) => {
                let mut sink = request.output.clone();
                let _ = writeln!(sink, "Skipping undecodable output: {e}");
            }
        }
    }

    fn finalize(&mut self, start: Instant) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let mut sink = request.output.clone();
        let _ = writeln!(sink, "Computation time: {:?}", start.elapsed());

        let mut rows: Vec<(&String, u64)> = self.counts.iter().map(|(w, c)| (w, *c)).collect();
        // Descending by frequency, then ascending by word.
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let total: u64 = rows.iter().map(|(_, c)| c).sum();
        let _ = writeln!(
            sink,
            "Computation {} counts {} different words out of {} words in total in {} files:",
            request.display_name(),
            rows.len(),
            total,
            self.files.load(Ordering::Relaxed)
        );

        let word_width = rows.iter().map(|(w, _)| w.chars().count()).max().unwrap_or(0);
        let count_width = rows
            .first()
            .map(|(_, c)| c.to_string().len())
            .unwrap_or(0);
        for (word, count) in rows {
            let pad = word_width - word.chars().count() + 1;
            let _ = writeln!(sink, "{word}{:pad$}: {count:>count_width$}", " ");
        }
    }
}

/// Split text into blank-line separated paragraphs. Line breaks within a
/// paragraph are kept as word separators.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

/// Count normalized (lower-cased, punctuation-stripped) words in a paragraph.
fn word_frequency(text: &str) -> HashMap<String, u64> {
    let mut frequency = HashMap::new();
    for raw in text.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            continue;
        }
        *frequency.entry(word.to_lowercase()).or_insert(0) += 1;
    }
    frequency
}
