use std::ops::Range;
use std::time::Duration;
#[cfg(test)] use std::sync::Mutex;

use rand::Rng;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn gen_f64_range(range: Range<f64>) -> f64;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_f64_range(range: Range<f64>) -> f64 {
        rand::rng().random_range(range)
    }
}

/// Periodic work (timeout sweeps, keep-alive pings, reconnect attempts) is spread out by a random
///  factor in `[1 - max_deviation, 1 + max_deviation)` so that many peers started at the same time
///  do not act in lock step.
pub fn jittered<R: Random>(period: Duration, max_deviation: f64) -> Duration {
    if max_deviation <= 0.0 {
        return period;
    }
    period.mul_f64(R::gen_f64_range((1.0 - max_deviation)..(1.0 + max_deviation)))
}

/// the default jitter of periodic maintenance loops
pub fn jittered_period(period: Duration) -> Duration {
    jittered::<RngRandom>(period, 0.1)
}
