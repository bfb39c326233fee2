//! Factorial of a non-negative integer, distributed one factor per partial.
//!
//! Meant for demonstration and testing: the partial computation is the
//! identity function over UTF-8 encoded integers, so the interesting part is
//! the distribution, not the arithmetic.

use std::io::Write;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::computation::{ArgumentError, BinaryData, Computation, ComputeRequest};

/// Constant delay per partial, so distribution across workers is observable.
const PARTIAL_DELAY: Duration = Duration::from_millis(250);

pub struct Factorial {
    request: Option<ComputeRequest>,
    result: u128,
}

impl Factorial {
    pub fn new() -> Self {
        Self {
            request: None,
            result: 1,
        }
    }
}

impl Default for Factorial {
    fn default() -> Self {
        Self::new()
    }
}

impl Computation for Factorial {
    fn name(&self) -> &'static str {
        "fac"
    }

    fn description(&self) -> &'static str {
        "computes the factorial of a given non-negative integer (for demonstration and testing)"
    }

    fn partition(
        &mut self,
        request: ComputeRequest,
    ) -> Result<mpsc::Receiver<BinaryData>, ArgumentError> {
        let n = match request.args.as_slice() {
            [arg] => arg
                .parse::<u64>()
                .map_err(|_| ArgumentError::new("one non-negative integer argument required"))?,
            _ => return Err(ArgumentError::new("one integer argument required")),
        };

        self.request = Some(request);
        self.result = 1;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for i in 2..=n {
                // UTF-8 encoded decimal serialization.
                if tx.send(Bytes::from(i.to_string())).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    fn partial_compute(&self, input: &BinaryData) -> Option<BinaryData> {
        std::thread::sleep(PARTIAL_DELAY);
        Some(input.clone()) // identity function
    }

    fn partial_compute_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn accumulate(&mut self, output: BinaryData) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let mut sink = request.output.clone();
        let factor = std::str::from_utf8(&output)
            .ok()
            .and_then(|s| s.parse::<u64>().ok());
        match factor {
            Some(n) => match self.result.checked_mul(u128::from(n)) {
                Some(product) => self.result = product,
                None => {
                    let _ = writeln!(sink, "Skipping factor {n}: result exceeds 128-bit range");
                }
            },
            None => {
                let _ = writeln!(sink, "Skipping undecodable output");
            }
        }
    }

    fn finalize(&mut self, start: Instant) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let mut sink = request.output.clone();
        let _ = writeln!(sink, "Computation time: {:?}", start.elapsed());
        let _ = writeln!(
            sink,
            "Computation {} = {}",
            request.display_name(),
            self.result
        );
    }
}
