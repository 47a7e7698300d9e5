use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, Axis};

use crate::error::Result;
use crate::signal::filter::{FilterChain, FilterKind};
use crate::signal::stats::std_dev;
use crate::signal::window::{Reduction, SampleWindow};

/// Pluggable processing step. Implementations must not mutate the input window.
pub trait WindowTransform: Send + Sync {
    fn name(&self) -> String;

    fn transform(&self, window: &SampleWindow) -> Result<SampleWindow>;
}

#[derive(Clone)]
pub enum ProcessingStage {
    RemoveDc,
    /// Divides every channel by its standard deviation (zero deviation divides by one).
    Normalize,
    /// Subtracts, per row, the mean across the window's channels.
    AverageReference,
    /// Zero-phase biquad chain run at the window's effective rate.
    Filter(Vec<FilterKind>),
    Custom(Arc<dyn WindowTransform>),
}

impl fmt::Debug for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl ProcessingStage {
    pub fn describe(&self) -> String {
        match self {
            ProcessingStage::RemoveDc => "remove_dc".to_string(),
            ProcessingStage::Normalize => "normalize".to_string(),
            ProcessingStage::AverageReference => "average_reference".to_string(),
            ProcessingStage::Filter(kinds) => kinds
                .iter()
                .map(FilterKind::describe)
                .collect::<Vec<_>>()
                .join(" -> "),
            ProcessingStage::Custom(stage) => stage.name(),
        }
    }
}

impl WindowTransform for ProcessingStage {
    fn name(&self) -> String {
        self.describe()
    }

    fn transform(&self, window: &SampleWindow) -> Result<SampleWindow> {
        match self {
            ProcessingStage::RemoveDc => {
                let mut values = window.values().to_owned();
                for mut column in values.axis_iter_mut(Axis(1)) {
                    let mean = column.mean().unwrap_or(0.0);
                    column.mapv_inplace(|v| v - mean);
                }
                window.with_values(values)
            }
            ProcessingStage::Normalize => {
                let mut values = window.values().to_owned();
                for mut column in values.axis_iter_mut(Axis(1)) {
                    let samples: Vec<f32> = column.iter().copied().collect();
                    let sd = std_dev(&samples);
                    let divisor = if sd > 0.0 { sd } else { 1.0 };
                    column.mapv_inplace(|v| v / divisor);
                }
                window.with_values(values)
            }
            ProcessingStage::AverageReference => {
                let values = window.values();
                let Some(row_means) = values.mean_axis(Axis(1)) else {
                    return Ok(window.clone());
                };
                let referenced = values - &row_means.insert_axis(Axis(1));
                window.with_values(referenced)
            }
            ProcessingStage::Filter(kinds) => {
                // Min/max rows are not a uniformly sampled signal.
                if window.reduction() == Reduction::Envelope || kinds.is_empty() {
                    return Ok(window.clone());
                }
                let rate = window.effective_rate() as f32;
                let mut values = Array2::<f32>::zeros(window.values().raw_dim());
                for (src, mut dst) in window
                    .values()
                    .axis_iter(Axis(1))
                    .zip(values.axis_iter_mut(Axis(1)))
                {
                    let samples: Vec<f32> = src.iter().copied().collect();
                    let mut chain = FilterChain::from_kinds(rate, kinds);
                    for (slot, v) in dst.iter_mut().zip(chain.filtfilt(&samples)) {
                        *slot = v;
                    }
                }
                window.with_values(values)
            }
            ProcessingStage::Custom(stage) => stage.transform(window),
        }
    }
}

/// Ordered chain of stages applied between the cache and the layout.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    stages: Vec<ProcessingStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<ProcessingStage>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: ProcessingStage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[ProcessingStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.stages.is_empty() {
            return "raw".to_string();
        }
        self.stages
            .iter()
            .map(ProcessingStage::describe)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn apply(&self, window: &SampleWindow) -> Result<SampleWindow> {
        let mut current = window.clone();
        for stage in &self.stages {
            current = stage.transform(&current)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn window(values: Array2<f32>) -> SampleWindow {
        let channels = (0..values.ncols()).collect();
        SampleWindow::native(100.0, 0, channels, values).unwrap()
    }

    struct Negate;

    impl WindowTransform for Negate {
        fn name(&self) -> String {
            "negate".into()
        }

        fn transform(&self, window: &SampleWindow) -> Result<SampleWindow> {
            window.with_values(window.values().mapv(|v| -v))
        }
    }

    #[test]
    fn remove_dc_then_normalize() {
        let input = window(array![[1.0, 10.0], [3.0, 10.0]]);
        let pipeline = Pipeline::new(vec![ProcessingStage::RemoveDc, ProcessingStage::Normalize]);
        let out = pipeline.apply(&input).unwrap();
        assert_eq!(out.values(), &array![[-1.0, 0.0], [1.0, 0.0]]);
        // Input untouched.
        assert_eq!(input.values()[[0, 0]], 1.0);
    }

    #[test]
    fn average_reference_removes_common_mode() {
        let input = window(array![[1.0, 3.0], [5.0, 5.0]]);
        let out = ProcessingStage::AverageReference.transform(&input).unwrap();
        assert_eq!(out.values(), &array![[-1.0, 1.0], [0.0, 0.0]]);
    }

    #[test]
    fn filters_skip_envelopes_and_custom_stages_run() {
        let env = SampleWindow::new(
            100.0,
            Reduction::Envelope,
            256,
            0,
            256,
            vec![0],
            array![[-1.0], [1.0]],
        )
        .unwrap();
        let stage = ProcessingStage::Filter(vec![FilterKind::Highpass {
            cutoff_hz: 1.0,
            q: 0.707,
        }]);
        assert_eq!(stage.transform(&env).unwrap().values(), env.values());

        let pipeline = Pipeline::new(vec![ProcessingStage::Custom(Arc::new(Negate)), stage]);
        assert_eq!(pipeline.describe(), "negate | highpass(cutoff=1, q=0.707)");
        assert_eq!(Pipeline::default().describe(), "raw");
    }
}
