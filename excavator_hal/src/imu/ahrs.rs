//! Mahony attitude filter (gyro + accel, no magnetometer).
//!
//! Proportional/integral feedback on the gravity-direction error keeps
//! the gyro integration from drifting. Gyro input is rad/s, accel input
//! is any consistent unit (it is normalized).

/// Unit quaternion, identity by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    /// Scalar part.
    pub w: f64,
    /// Vector x.
    pub x: f64,
    /// Vector y.
    pub y: f64,
    /// Vector z.
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self { w: 1.0, x: 0.0, y: 0.0, z: 0.0 }
    }
}

/// Mahony AHRS state.
pub struct Mahony {
    kp: f64,
    ki: f64,
    ix: f64,
    iy: f64,
    iz: f64,
    /// Current attitude estimate.
    pub q: Quaternion,
}

impl Mahony {
    /// Filter with the customary gains (kp = 2, ki = 0.005).
    pub fn new() -> Self {
        Self { kp: 2.0, ki: 0.005, ix: 0.0, iy: 0.0, iz: 0.0, q: Quaternion::default() }
    }

    /// One fusion step: gyro [rad/s], accel in any consistent unit, dt [s].
    ///
    /// A zero-norm accel sample contributes no correction; the gyro is
    /// still integrated.
    pub fn update(&mut self, dt: f64, gyro: [f64; 3], accel: [f64; 3]) {
        let (mut gx, mut gy, mut gz) = (gyro[0], gyro[1], gyro[2]);
        let (q0, q1, q2, q3) = (self.q.w, self.q.x, self.q.y, self.q.z);

        let norm_sq = accel[0] * accel[0] + accel[1] * accel[1] + accel[2] * accel[2];
        if norm_sq > 0.0 {
            let recip = norm_sq.sqrt().recip();
            let ax = accel[0] * recip;
            let ay = accel[1] * recip;
            let az = accel[2] * recip;

            // Estimated gravity direction from the current attitude.
            let halfvx = q1 * q3 - q0 * q2;
            let halfvy = q0 * q1 + q2 * q3;
            let halfvz = q0 * q0 - 0.5 + q3 * q3;

            // Error is the cross product of measured and estimated gravity.
            let halfex = ay * halfvz - az * halfvy;
            let halfey = az * halfvx - ax * halfvz;
            let halfez = ax * halfvy - ay * halfvx;

            if self.ki > 0.0 {
                self.ix += self.ki * halfex * dt;
                self.iy += self.ki * halfey * dt;
                self.iz += self.ki * halfez * dt;
            } else {
                self.ix = 0.0;
                self.iy = 0.0;
                self.iz = 0.0;
            }

            gx += self.kp * halfex + self.ix;
            gy += self.kp * halfey + self.iy;
            gz += self.kp * halfez + self.iz;
        }

        // Integrate quaternion rate.
        let gx = gx * (0.5 * dt);
        let gy = gy * (0.5 * dt);
        let gz = gz * (0.5 * dt);
        let (qa, qb, qc) = (q0, q1, q2);
        let mut q0 = q0 + (-qb * gx - qc * gy - q3 * gz);
        let mut q1 = q1 + (qa * gx + qc * gz - q3 * gy);
        let mut q2 = q2 + (qa * gy - qb * gz + q3 * gx);
        let mut q3 = q3 + (qa * gz + qb * gy - qc * gx);

        let recip = (q0 * q0 + q1 * q1 + q2 * q2 + q3 * q3).sqrt().recip();
        q0 *= recip;
        q1 *= recip;
        q2 *= recip;
        q3 *= recip;
        self.q = Quaternion { w: q0, x: q1, y: q2, z: q3 };
    }

    /// Euler angles (roll, pitch, yaw) [rad] of the current estimate.
    pub fn euler(&self) -> (f64, f64, f64) {
        let (q0, q1, q2, q3) = (self.q.w, self.q.x, self.q.y, self.q.z);

        let sinr_cosp = 2.0 * (q0 * q1 + q2 * q3);
        let cosr_cosp = 1.0 - 2.0 * (q1 * q1 + q2 * q2);
        let roll = sinr_cosp.atan2(cosr_cosp);

        let sinp = 2.0 * (q0 * q2 - q3 * q1);
        let pitch = if sinp.abs() >= 1.0 {
            std::f64::consts::FRAC_PI_2.copysign(sinp)
        } else {
            sinp.asin()
        };

        let siny_cosp = 2.0 * (q0 * q3 + q1 * q2);
        let cosy_cosp = 1.0 - 2.0 * (q2 * q2 + q3 * q3);
        let yaw = siny_cosp.atan2(cosy_cosp);

        (roll, pitch, yaw)
    }
}

impl Default for Mahony {
    fn default() -> Self {
        Self::new()
    }
}
