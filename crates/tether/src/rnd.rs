// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Source of the factor that spreads retry backoffs apart.
///
/// Not cryptographically secure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum Rnd {
    #[default]
    Fastrand,

    #[cfg(test)]
    Fixed(f64),
}

impl Rnd {
    /// Scales `delay` by a factor drawn uniformly from `[0, 1]`.
    pub fn jitter(self, delay: Duration) -> Duration {
        let factor = match self {
            Self::Fastrand => fastrand::f64(),
            #[cfg(test)]
            Self::Fixed(factor) => factor,
        };

        delay.mul_f64(factor.clamp(0.0, 1.0))
    }
}
