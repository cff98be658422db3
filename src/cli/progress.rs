use blazectl::upload::UploadProgress;
use indicatif::{ProgressBar as IndicatifProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Progress bar wrapper around indicatif for displaying upload progress.
pub struct ProgressBar {
    pb: IndicatifProgressBar,
    ewma_secs: Mutex<f64>,
}

impl ProgressBar {
    pub fn new(total: usize) -> Self {
        let pb = IndicatifProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg} | ETA: {eta}")
                .unwrap()
                .progress_chars("█▓▒░ "),
        );

        Self {
            pb,
            ewma_secs: Mutex::new(0.0),
        }
    }
}

impl UploadProgress for ProgressBar {
    fn increment(&self, sample: Duration) {
        // The sample is already concurrency-normalised; the moving average
        // keeps the displayed per-bundle time from jittering.
        let mut ewma = self.ewma_secs.lock().unwrap();
        let sample_secs = sample.as_secs_f64();
        *ewma = if *ewma == 0.0 {
            sample_secs
        } else {
            0.9 * *ewma + 0.1 * sample_secs
        };
        self.pb.set_message(format!("{:.0}ms/bundle", *ewma * 1000.0));
        drop(ewma);

        self.pb.inc(1);
    }

    fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
