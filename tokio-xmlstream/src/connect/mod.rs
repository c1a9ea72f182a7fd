// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Socket establishment: address candidates, backoff, proxy tunnelling and
//! TLS.

use core::time::Duration;

use rand::{thread_rng, Rng};
use tokio::io::{AsyncRead, AsyncWrite};

mod dns;
pub(crate) mod proxy;
pub(crate) mod tls;

pub use dns::DnsConfig;

/// Trait of transports the stream engine can run over.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// A boxed transport: a plain TCP socket, a TLS session, or anything a test
/// injects.
pub type Transport = Box<dyn AsyncReadAndWrite>;

/// Computes the delay before the next connection attempt.
///
/// The first attempt is immediate. After a failure the delay doubles up to
/// `max_delay`, with roughly ten percent of jitter so that a crowd of
/// clients does not reconnect in lockstep.
pub(crate) fn next_delay(previous: Option<Duration>, max_delay: Duration) -> Duration {
    let base = match previous {
        None => return Duration::ZERO,
        Some(d) if d.is_zero() => Duration::from_secs(1),
        Some(d) => core::cmp::min(d.saturating_mul(2), max_delay),
    };
    let jittered = base.mul_f64(thread_rng().gen_range(0.9..=1.1));
    core::cmp::min(jittered, max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(next_delay(None, Duration::from_secs(600)), Duration::ZERO);
    }

    #[test]
    fn delays_grow_up_to_jitter_and_stay_bounded() {
        let max = Duration::from_secs(600);
        let mut previous = Duration::ZERO;
        for _ in 0..16 {
            let delay = next_delay(Some(previous), max);
            // Doubling minus the 10% jitter can never shrink the delay.
            assert!(delay >= previous.mul_f64(1.5) || delay >= max.mul_f64(0.9));
            assert!(delay <= max);
            previous = delay;
        }
        assert!(previous >= max.mul_f64(0.9));
    }
}
