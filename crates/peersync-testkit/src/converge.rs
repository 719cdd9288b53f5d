//! Drive a [`TestCircle`] until it settles.
//!
//! Every round lets each ordered pair of peers exchange one message. The
//! circle has settled after two consecutive rounds in which nobody had
//! anything to send.

use rand::Rng;

use peersync_engine::Result;

use crate::fixtures::TestCircle;

/// Outcome of a convergence run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Rounds run, including the quiet ones.
    pub rounds: usize,
    /// Messages delivered.
    pub delivered: usize,
    /// Messages created but thrown away.
    pub dropped: usize,
    /// Whether the circle went quiet within the round limit.
    pub settled: bool,
}

/// Exchange messages until the circle is quiet or `max_rounds` ran out.
pub fn converge(circle: &mut TestCircle, max_rounds: usize) -> Result<ConvergeReport> {
    run(circle, max_rounds, |_| true)
}

/// Like [`converge`], but each message is lost with `drop_probability`.
pub fn converge_lossy<R: Rng>(
    circle: &mut TestCircle,
    max_rounds: usize,
    drop_probability: f64,
    rng: &mut R,
) -> Result<ConvergeReport> {
    run(circle, max_rounds, |_| !rng.gen_bool(drop_probability))
}

fn run<F>(circle: &mut TestCircle, max_rounds: usize, mut deliver: F) -> Result<ConvergeReport>
where
    F: FnMut(&(usize, usize)) -> bool,
{
    let mut report = ConvergeReport::default();
    let mut quiet_rounds = 0;
    let count = circle.peers.len();

    while report.rounds < max_rounds {
        report.rounds += 1;
        let mut quiet = true;

        for from in 0..count {
            for to in 0..count {
                if from == to {
                    continue;
                }
                let delivered = deliver(&(from, to));
                if circle.exchange(from, to, delivered)? {
                    quiet = false;
                    if delivered {
                        report.delivered += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }
        }

        if quiet {
            quiet_rounds += 1;
            if quiet_rounds == 2 {
                report.settled = true;
                break;
            }
        } else {
            quiet_rounds = 0;
        }
    }

    tracing::debug!(?report, "convergence run finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::object;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_pair_converges() {
        let mut circle = TestCircle::pair().unwrap();
        circle.peer_mut(0).commit(object("a", b"1")).unwrap();
        circle.peer_mut(1).commit(object("b", b"2")).unwrap();
        let expected = circle.union();

        let report = converge(&mut circle, 20).unwrap();
        assert!(report.settled);
        assert!(circle.agrees());
        assert_eq!(circle.peer(0).local(), expected);
    }

    #[test]
    fn test_converges_despite_losses() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut circle = TestCircle::new(3).unwrap();
        for (n, key) in ["a", "b", "c"].iter().enumerate() {
            circle.peer_mut(n).commit(object(key, b"x")).unwrap();
        }
        let expected = circle.union();

        let report = converge_lossy(&mut circle, 200, 0.3, &mut rng).unwrap();
        assert!(report.settled);
        assert!(circle.agrees());
        assert_eq!(circle.peer(2).local(), expected);
    }

    #[test]
    fn test_round_limit() {
        let mut circle = TestCircle::pair().unwrap();
        circle.peer_mut(0).commit(object("a", b"1")).unwrap();

        let report = converge(&mut circle, 1).unwrap();
        assert_eq!(report.rounds, 1);
        assert!(!report.settled);
    }
}
