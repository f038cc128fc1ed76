/*!
Proposal moves and the Metropolis-Hastings test.

Every move mutates a [`FitState`] in place, evaluates the new log-posterior
and either keeps the new state or restores the previous one exactly. The
returned [`MoveRecord`] says which free entries were touched and whether the
proposal was accepted.

Two moves are available:

- a Gibbs random walk on one free entry, scaled by that entry's step size;
- a differential-evolution jump along the difference of two rows of a buffer
  of earlier states, scaled by a global correction factor.

[`Mover::DeGibbs`] picks between the two with equal probability.
*/

use ndarray::ArrayView2;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::likelihood::LogPosterior;
use crate::state::{FitState, MoveIndex};

/// Outcome of one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub accepted: bool,
    pub index: MoveIndex,
}

/// Move selection policy of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mover {
    /// Gibbs steps only, for runs without a buffer.
    Gibbs,
    /// Gibbs or differential-evolution with probability 1/2 each.
    DeGibbs,
}

impl Mover {
    /// Performs one proposal.
    ///
    /// [`Mover::DeGibbs`] falls back to a Gibbs step when `buffer` is missing
    /// or has no rows.
    pub fn step<L, R>(
        self,
        state: &mut FitState,
        likelihood: &L,
        buffer: Option<ArrayView2<f64>>,
        correction_scale: f64,
        rng: &mut R,
    ) -> MoveRecord
    where
        L: LogPosterior + ?Sized,
        R: Rng + ?Sized,
    {
        match (self, buffer) {
            (Mover::DeGibbs, Some(buffer)) if buffer.nrows() > 0 => {
                if rng.gen::<f64>() < 0.5 {
                    gibbs_move(state, likelihood, rng)
                } else {
                    vector_jump(state, likelihood, buffer, correction_scale, rng)
                }
            }
            _ => gibbs_move(state, likelihood, rng),
        }
    }
}

/// Metropolis-Hastings test of `new` against `old`.
///
/// A non-finite `new` is always rejected. A finite `new` is always accepted
/// from a rejected `old`.
pub fn metropolis_accept<R: Rng + ?Sized>(old: f64, new: f64, rng: &mut R) -> bool {
    if !new.is_finite() {
        return false;
    }
    if !old.is_finite() {
        return true;
    }
    let u: f64 = rng.gen();
    u <= (new - old).exp().min(1.0)
}

/// Perturbs one free entry, chosen uniformly, by `N(0, step_size[i])`.
///
/// # Panics
///
/// If the state has no free entries.
pub fn gibbs_move<L, R>(state: &mut FitState, likelihood: &L, rng: &mut R) -> MoveRecord
where
    L: LogPosterior + ?Sized,
    R: Rng + ?Sized,
{
    let i = rng.gen_range(0..state.n_free());
    let old_value = state.free_vector()[i];
    let z: f64 = rng.sample(StandardNormal);
    state.set_free_value(i, old_value + state.step_size()[i] * z);

    let new_ll = likelihood.log_posterior(state);
    let accepted = metropolis_accept(state.log_likelihood, new_ll, rng);
    if accepted {
        state.log_likelihood = new_ll;
    } else {
        state.set_free_value(i, old_value);
    }
    let index = MoveIndex::Gibbs(i);
    state.last_move = index;
    MoveRecord { accepted, index }
}

/// Adds `correction_scale * (buffer[a] - buffer[b])` to the free vector for
/// two distinct random rows `a`, `b` (equal only for a one-row buffer).
///
/// # Panics
///
/// If `buffer` is empty or its width differs from the number of free entries.
pub fn vector_jump<L, R>(
    state: &mut FitState,
    likelihood: &L,
    buffer: ArrayView2<f64>,
    correction_scale: f64,
    rng: &mut R,
) -> MoveRecord
where
    L: LogPosterior + ?Sized,
    R: Rng + ?Sized,
{
    let n = buffer.nrows();
    let a = rng.gen_range(0..n);
    let b = if n > 1 {
        let b = rng.gen_range(0..n - 1);
        if b >= a {
            b + 1
        } else {
            b
        }
    } else {
        a
    };
    let jump = &buffer.row(a) - &buffer.row(b);

    let previous = state.free_vector().to_owned();
    state.apply_jump(jump.view(), correction_scale);

    let new_ll = likelihood.log_posterior(state);
    let accepted = metropolis_accept(state.log_likelihood, new_ll, rng);
    if accepted {
        state.log_likelihood = new_ll;
    } else {
        state.restore_free(previous);
    }
    state.last_move = MoveIndex::VectorJump;
    MoveRecord {
        accepted,
        index: MoveIndex::VectorJump,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamConfig;
    use crate::data::InputData;
    use crate::priors::{PriorRegistry, PriorSpec, REJECT};
    use ndarray::{arr1, arr2, Array2};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn state(step: f64) -> FitState {
        let data = InputData::from_flux(
            arr1(&[0.0, 1.0]).view(),
            arr1(&[1.0]).view(),
            Array2::zeros((1, 2)),
            Array2::ones((1, 2)),
        )
        .unwrap();
        let params = vec![
            ParamConfig::fitted("a", 1.0, PriorSpec::uniform(-5.0, 5.0)).with_beta(step),
            ParamConfig::fitted("b", 2.0, PriorSpec::uniform(-5.0, 5.0)).with_beta(step),
        ];
        FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap()
    }

    fn flat(state: &FitState) -> f64 {
        crate::likelihood::log_prior(state)
    }

    fn rejecting(_: &FitState) -> f64 {
        REJECT
    }

    #[test]
    fn zero_step_is_always_accepted() {
        let mut s = state(0.0);
        s.log_likelihood = flat(&s);
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..200 {
            let record = gibbs_move(&mut s, &flat, &mut rng);
            assert!(record.accepted);
            assert!(matches!(record.index, MoveIndex::Gibbs(i) if i < 2));
        }
        assert_eq!(s.free_vector(), arr1(&[1.0, 2.0]));
    }

    #[test]
    fn rejected_gibbs_restores_state() {
        let mut s = state(0.5);
        s.log_likelihood = 0.0;
        let grid = s.full_grid().to_owned();
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..50 {
            let record = gibbs_move(&mut s, &rejecting, &mut rng);
            assert!(!record.accepted);
            assert_eq!(s.full_grid(), grid);
            assert_eq!(s.log_likelihood, 0.0);
        }
    }

    #[test]
    fn vector_jump_moves_along_buffer_difference() {
        let mut s = state(0.1);
        s.log_likelihood = flat(&s);
        let buffer = arr2(&[[0.0, 0.0], [1.0, 2.0]]);
        let mut rng = SmallRng::seed_from_u64(11);
        let record = vector_jump(&mut s, &flat, buffer.view(), 0.5, &mut rng);
        assert!(record.accepted);
        assert_eq!(record.index, MoveIndex::VectorJump);
        let moved = s.free_vector().to_owned();
        let up = arr1(&[1.5, 3.0]);
        let down = arr1(&[0.5, 1.0]);
        assert!(moved == up || moved == down, "unexpected jump to {moved}");
        assert_eq!(s.get("b").unwrap()[0], moved[1]);
    }

    #[test]
    fn rejected_vector_jump_restores_exactly() {
        let mut s = state(0.1);
        s.log_likelihood = -1.0;
        let before = s.free_vector().to_owned();
        let buffer = arr2(&[[0.1, 0.3], [0.7, -0.2], [0.4, 0.9]]);
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..20 {
            let record = vector_jump(&mut s, &rejecting, buffer.view(), 0.3, &mut rng);
            assert!(!record.accepted);
            assert_eq!(s.free_vector(), before);
        }
        assert_eq!(s.last_move, MoveIndex::VectorJump);
    }

    #[test]
    fn de_gibbs_without_buffer_uses_gibbs() {
        let mut s = state(0.1);
        s.log_likelihood = flat(&s);
        let mut rng = SmallRng::seed_from_u64(8);
        let empty = Array2::<f64>::zeros((0, 2));
        for _ in 0..20 {
            let r = Mover::DeGibbs.step(&mut s, &flat, Some(empty.view()), 0.3, &mut rng);
            assert!(matches!(r.index, MoveIndex::Gibbs(_)));
            let r = Mover::DeGibbs.step(&mut s, &flat, None, 0.3, &mut rng);
            assert!(matches!(r.index, MoveIndex::Gibbs(_)));
        }
    }

    #[test]
    fn de_gibbs_mixes_both_moves() {
        let mut s = state(0.1);
        s.log_likelihood = flat(&s);
        let buffer = arr2(&[[0.0, 0.0], [0.1, 0.1], [0.2, -0.1]]);
        let mut rng = SmallRng::seed_from_u64(21);
        let jumps = (0..1000)
            .map(|_| Mover::DeGibbs.step(&mut s, &flat, Some(buffer.view()), 0.3, &mut rng))
            .filter(|r| r.index == MoveIndex::VectorJump)
            .count();
        assert!((400..600).contains(&jumps), "{jumps} vector jumps out of 1000");
    }

    #[test]
    fn accept_rules() {
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(metropolis_accept(-10.0, -5.0, &mut rng));
        assert!(metropolis_accept(REJECT, -5.0, &mut rng));
        assert!(!metropolis_accept(-5.0, REJECT, &mut rng));
        assert!(!metropolis_accept(-5.0, f64::NAN, &mut rng));
        let accepted = (0..10_000)
            .filter(|_| metropolis_accept(0.0, (0.25f64).ln(), &mut rng))
            .count();
        assert!((2200..2800).contains(&accepted));
    }
}
