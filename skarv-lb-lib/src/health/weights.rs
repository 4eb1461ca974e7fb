//! Effective-weight redistribution.
//!
//! Given the configured weights and per-target availability, produce the
//! vector actually written to the kernel routes:
//!
//! 1. If every target is unavailable the original vector is kept, so a
//!    fully failed pool degrades to configured proportions instead of
//!    blackholing (graceful degradation under total failure).
//! 2. Otherwise unavailable targets get zero and the remainder is scaled to
//!    sum exactly 100, with the integer-rounding residual folded into the
//!    first nonzero weight.
//! 3. A target in recovery step `s` (0..=3) is capped at
//!    `⌊original·(s+1)/4⌋` before scaling, producing the 25/50/75/100%
//!    ramp as it comes back.

/// Weight a recovering target contributes before renormalization.
pub fn recovery_weight(original: u8, step: u8) -> u8 {
    let step = step.min(3);
    let ramped = (u32::from(original) * (u32::from(step) + 1)) / 4;
    (ramped as u8).min(original)
}

/// Compute effective weights. `available[i]` is false for targets that must
/// receive no traffic (unhealthy, or excluded by an open circuit);
/// `recovery_step[i]` is set while a target ramps back up.
pub fn redistribute(
    original: &[u8],
    available: &[bool],
    recovery_step: &[Option<u8>],
) -> Vec<u8> {
    debug_assert_eq!(original.len(), available.len());
    debug_assert_eq!(original.len(), recovery_step.len());

    if available.iter().all(|a| !a) {
        return original.to_vec();
    }

    let mut weights: Vec<u32> = original
        .iter()
        .zip(available)
        .zip(recovery_step)
        .map(|((&w, &avail), step)| {
            if !avail {
                0
            } else if let Some(s) = step {
                u32::from(recovery_weight(w, *s))
            } else {
                u32::from(w)
            }
        })
        .collect();

    let sum: u32 = weights.iter().sum();
    if sum == 0 {
        // Available targets whose ramped weights all floor to zero: nothing
        // meaningful to scale, keep the configured vector.
        return original.to_vec();
    }

    for w in &mut weights {
        *w = *w * 100 / sum;
    }
    let scaled: u32 = weights.iter().sum();
    let residual = 100 - scaled;
    if let Some(first) = weights.iter_mut().find(|w| **w > 0) {
        *first += residual;
    }
    weights.iter().map(|&w| w as u8).collect()
}

/// Prefix sums of an effective weight vector, as stored in the route slots.
pub fn cumulative(weights: &[u8]) -> Vec<u16> {
    let mut cum = 0u16;
    weights
        .iter()
        .map(|&w| {
            cum = cum.saturating_add(u16::from(w));
            cum
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_targets_sum_to_exactly_100() {
        for weights in [vec![50u8, 50], vec![33, 33, 34], vec![10, 20, 70], vec![1, 1, 1]] {
            let available = vec![true; weights.len()];
            let steps = vec![None; weights.len()];
            let eff = redistribute(&weights, &available, &steps);
            assert_eq!(eff.iter().map(|&w| u32::from(w)).sum::<u32>(), 100, "{weights:?}");
        }
    }

    #[test]
    fn all_unavailable_keeps_original() {
        let eff = redistribute(&[50, 30, 20], &[false, false, false], &[None, None, None]);
        assert_eq!(eff, vec![50, 30, 20]);
    }

    #[test]
    fn unavailable_target_gets_zero() {
        let eff = redistribute(&[50, 50], &[true, false], &[None, None]);
        assert_eq!(eff, vec![100, 0]);
    }

    #[test]
    fn partial_failure_rescales_remainder() {
        let eff = redistribute(&[40, 40, 20], &[true, false, true], &[None, None, None]);
        assert_eq!(eff[1], 0);
        assert_eq!(eff.iter().map(|&w| u32::from(w)).sum::<u32>(), 100);
        // 40:20 keeps its 2:1 proportion: 67/33 after residual adjustment.
        assert_eq!(eff, vec![67, 0, 33]);
    }

    #[test]
    fn recovery_ramp_is_quarter_steps() {
        for (step, expected) in [(0u8, 12u8), (1, 25), (2, 37), (3, 50)] {
            assert_eq!(recovery_weight(50, step), expected);
        }
        assert_eq!(recovery_weight(50, 9), 50); // capped at the original
        assert_eq!(recovery_weight(100, 0), 25);
        assert_eq!(recovery_weight(100, 3), 100);
    }

    #[test]
    fn recovery_is_applied_before_renormalization() {
        // Target 1 at step 0 contributes 12 of its 50; scaled to sum 100.
        let eff = redistribute(&[50, 50], &[true, true], &[None, Some(0)]);
        assert_eq!(eff.iter().map(|&w| u32::from(w)).sum::<u32>(), 100);
        assert!(eff[0] > eff[1]);
        // 50:12 scales to 80:19 with the residual on the first slot.
        assert_eq!(eff, vec![81, 19]);
    }

    #[test]
    fn full_recovery_restores_balance() {
        let eff = redistribute(&[50, 50], &[true, true], &[None, Some(3)]);
        assert_eq!(eff, vec![50, 50]);
    }

    #[test]
    fn cumulative_is_monotonic_and_ends_at_100() {
        let cum = cumulative(&[67, 0, 33]);
        assert_eq!(cum, vec![67, 67, 100]);
        assert!(cum.windows(2).all(|w| w[0] <= w[1]));
    }
}
