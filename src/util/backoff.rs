use std::time::Duration;

use crate::config::RpcConfig;
use crate::util::random::{jittered, Random, RngRandom};

/// Exponential backoff for reconnect attempts: the first attempt (`try_index == 0`) happens
///  immediately, every failed attempt multiplies the delay by a constant factor up to a maximum.
#[derive(Debug, Clone)]
pub struct ReconnectDelayer {
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
}

impl ReconnectDelayer {
    pub fn new(config: &RpcConfig) -> ReconnectDelayer {
        ReconnectDelayer {
            min_delay: config.reconnect_delay_min,
            max_delay: config.reconnect_delay_max,
            factor: config.reconnect_delay_factor,
        }
    }

    pub fn base_delay(&self, try_index: u32) -> Duration {
        if try_index == 0 {
            return Duration::ZERO;
        }

        let exponent = (try_index - 1).min(64) as i32;
        let nanos = (self.min_delay.as_nanos() as f64 * self.factor.powi(exponent)).round();
        if nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        }
        else {
            Duration::from_nanos(nanos as u64)
        }
    }

    pub fn delay(&self, try_index: u32) -> Duration {
        self.delay_with::<RngRandom>(try_index)
    }

    fn delay_with<R: Random>(&self, try_index: u32) -> Duration {
        jittered::<R>(self.base_delay(try_index), 0.1)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};

    #[rstest]
    #[case::first(0, 0)]
    #[case::second(1, 100)]
    #[case::third(2, 150)]
    #[case::fourth(3, 225)]
    #[case::capped(20, 10_000)]
    #[case::huge(u32::MAX, 10_000)]
    fn test_base_delay(#[case] try_index: u32, #[case] expected_millis: u64) {
        let delayer = ReconnectDelayer::new(&RpcConfig::new());
        assert_eq!(delayer.base_delay(try_index).as_millis() as u64, expected_millis);
    }

    #[test]
    fn test_delay_is_jittered() {
        let _lock = MOCK_RANDOM_MUTEX.lock().unwrap();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.9);

        let delayer = ReconnectDelayer::new(&RpcConfig::new());
        assert_eq!(delayer.delay_with::<MockRandom>(1), Duration::from_millis(90));
    }
}
