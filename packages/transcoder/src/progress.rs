//! Parsing of ffmpeg's `-progress` key/value stream.

/// Incremental state built from `-progress pipe:1` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressParser {
    /// Encoded media time so far, in microseconds.
    pub out_time_us: i64,
    pub frame: u64,
    pub speed: Option<f64>,
    pub is_complete: bool,
    expected_us: Option<i64>,
}

impl ProgressParser {
    pub fn new(expected_duration_secs: Option<f64>) -> Self {
        Self {
            expected_us: expected_duration_secs
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| (d * 1_000_000.0) as i64),
            ..Default::default()
        }
    }

    /// Feed one line. Returns the completed fraction (0.0..=1.0) whenever a
    /// progress block ends and the fraction is known.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // `out_time_ms` is microseconds as well, despite the name.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_us = us.max(0);
                }
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            "speed" => {
                self.speed = value
                    .strip_suffix('x')
                    .and_then(|s| s.trim().parse().ok());
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                    return Some(1.0);
                }
                return self.fraction();
            }
            _ => {}
        }
        None
    }

    pub fn fraction(&self) -> Option<f64> {
        let expected = self.expected_us?;
        Some((self.out_time_us as f64 / expected as f64).clamp(0.0, 1.0))
    }
}
