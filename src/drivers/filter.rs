/// First-order low-pass: `y = alpha * x + (1 - alpha) * y_prev`.
///
/// The state starts at zero, so the first output is already attenuated.
#[derive(Debug, Clone, Copy)]
pub struct LowPassFilter {
    alpha: f32,
    last_output: f32,
}

impl LowPassFilter {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            last_output: 0.0,
        }
    }

    pub fn filter(&mut self, input: f32) -> f32 {
        self.last_output = self.alpha * input + (1.0 - self.alpha) * self.last_output;
        self.last_output
    }

    pub fn value(&self) -> f32 {
        self.last_output
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.last_output = 0.0;
    }
}
