use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    metrics::{EvaluationSummary, ExponentialMovingAverage, TrainSummary},
    state::TrainingState,
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub every_n_steps: usize,
}

impl LoggingSettings {
    pub fn from_config(enable_stdout: bool, every_n_steps: usize) -> Self {
        Self {
            enable_stdout,
            every_n_steps: every_n_steps.max(1),
        }
    }

    pub fn quiet() -> Self {
        Self::from_config(false, 1)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self::from_config(true, 100)
    }
}

/// Human-readable progress lines on stdout.
pub struct Logger {
    settings: LoggingSettings,
    loss_ema: ExponentialMovingAverage,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Self {
        Self {
            settings,
            loss_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn settings(&self) -> &LoggingSettings {
        &self.settings
    }

    /// Called after every step; prints on the configured cadence.
    pub fn log_step(&mut self, state: &TrainingState) {
        let Some(loss) = state.batch_loss else {
            return;
        };
        let smoothed = self.loss_ema.update(loss);
        if !self.settings.enable_stdout || state.model_updates % self.settings.every_n_steps as u64 != 0
        {
            return;
        }
        println!(
            "step={} epoch={:.3} loss={:.4} loss_ema={:.4} bs={} requested={} lr={:.5e} step_time={:.4}s",
            state.model_updates,
            state.epochs(),
            loss,
            smoothed,
            state.batch_size,
            state.damping,
            state.learning_rate,
            state.step_time
        );
    }

    pub fn log_progress(&self, state: &TrainingState) {
        if self.settings.enable_stdout {
            println!(
                "epoch={:.2} examples={} updates={} bs={} loss={:.4}",
                state.epochs(),
                state.num_examples,
                state.model_updates,
                state.batch_size,
                state.batch_loss.unwrap_or(f64::NAN)
            );
        }
    }

    pub fn log_evaluation(&self, prefix: &str, epochs: f64, summary: &EvaluationSummary) {
        if !self.settings.enable_stdout {
            return;
        }
        match summary.accuracy {
            Some(accuracy) => println!(
                "{} epoch={:.2} loss={:.4} acc={:.2}% examples={}",
                prefix,
                epochs,
                summary.loss,
                accuracy * 100.0,
                summary.examples
            ),
            None => println!(
                "{} epoch={:.2} loss={:.4} examples={}",
                prefix, epochs, summary.loss, summary.examples
            ),
        }
    }

    pub fn log_train_summary(&self, summary: &TrainSummary) {
        if self.settings.enable_stdout {
            println!(
                "trained epochs={:.2} examples={} in {:.2}s",
                summary.epochs, summary.num_examples, summary.train_time
            );
        }
    }
}

/// Writes one JSON object per line.
pub struct ResultsWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl ResultsWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to create results directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create results file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<(), TrainingError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<'a, T, I>(&mut self, records: I) -> Result<(), TrainingError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        for record in records {
            self.write(record)?;
        }
        self.flush()
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush results file {}: {err}",
                self.path.display()
            ))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Drop for ResultsWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        epoch: usize,
        loss: f64,
    }

    #[test]
    fn writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.jsonl");

        let mut writer = ResultsWriter::create(&path).unwrap();
        let rows = vec![Row { epoch: 0, loss: 1.5 }, Row { epoch: 1, loss: 0.5 }];
        writer.write_all(&rows).unwrap();
        assert_eq!(writer.written(), 2);
        drop(writer);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["epoch"], 1);
        assert_eq!(second["loss"], 0.5);
    }

    #[test]
    fn quiet_logger_still_tracks_loss() {
        let mut logger = Logger::new(LoggingSettings::quiet());
        let mut state = TrainingState::new(10, 0.1);
        state.batch_loss = Some(2.0);
        state.model_updates = 1;
        logger.log_step(&state);
        assert_eq!(logger.loss_ema.value(), Some(2.0));
        assert!(!logger.settings().enable_stdout);
    }
}
