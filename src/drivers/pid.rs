use crate::drivers::filter::LowPassFilter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub feedforward: f32,
    pub integral_limit: f32,
    pub output_limit: f32,
    /// Smoothing factor of the derivative low-pass, 0..=1.
    pub derivative_alpha: f32,
}

impl PidGains {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            feedforward: 0.0,
            integral_limit: 10.0,
            output_limit: 10.0,
            derivative_alpha: 0.1,
        }
    }
}

/// PID with integrator clamping and a filtered derivative.
///
/// One instance per axis; state only changes inside `calculate` and `reset`.
pub struct PidController {
    gains: PidGains,
    integral: f32,
    prev_error: f32,
    derivative: LowPassFilter,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains: PidGains {
                integral_limit: gains.integral_limit.abs(),
                output_limit: gains.output_limit.abs(),
                ..gains
            },
            integral: 0.0,
            prev_error: 0.0,
            derivative: LowPassFilter::new(gains.derivative_alpha),
        }
    }

    pub fn calculate(&mut self, setpoint: f32, measurement: f32, dt: f32) -> f32 {
        // Clock anomaly or a repeated call within the same tick.
        if !(dt > 0.0) || !dt.is_finite() {
            return 0.0;
        }

        let g = &self.gains;
        let error = setpoint - measurement;

        let p_term = g.kp * error;

        self.integral = (self.integral + error * dt).clamp(-g.integral_limit, g.integral_limit);
        let i_term = g.ki * self.integral;

        let raw_derivative = (error - self.prev_error) / dt;
        let d_term = g.kd * self.derivative.filter(raw_derivative);

        self.prev_error = error;

        let output = g.feedforward * setpoint + p_term + i_term + d_term;
        output.clamp(-g.output_limit, g.output_limit)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.derivative.reset();
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn previous_error(&self) -> f32 {
        self.prev_error
    }

    pub fn filtered_derivative(&self) -> f32 {
        self.derivative.value()
    }
}
