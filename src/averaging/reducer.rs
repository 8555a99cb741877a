//! Weighted mean over a set of contributions
//!
//! Summation runs in `f64`, in peer-id order, so the result does not depend
//! on the order contributions arrived in. Weights are renormalized over
//! whatever set is passed in; if every weight is zero, all count equally.

use std::collections::HashMap;

use crate::dht::PeerId;
use crate::error::{Error, Result};

/// One peer's slice of a part
#[derive(Debug, Clone, PartialEq)]
pub struct PartContribution {
    pub weight: f64,
    pub data: Vec<f32>,
}

/// Weighted arithmetic mean of equally sized buffers
pub fn weighted_average(contributions: &[(PeerId, f64, &[f32])]) -> Result<Vec<f32>> {
    let Some(first) = contributions.first() else {
        return Err(Error::Internal("cannot average an empty set".to_string()));
    };
    let len = first.2.len();
    if let Some((peer, _, data)) = contributions.iter().find(|(_, _, d)| d.len() != len) {
        return Err(Error::ProtocolMalformed {
            message: format!(
                "contribution from {} has {} elements, expected {}",
                peer.short(),
                data.len(),
                len
            ),
        });
    }

    let mut ordered: Vec<&(PeerId, f64, &[f32])> = contributions.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let sanitize = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let total_weight: f64 = ordered.iter().map(|(_, w, _)| sanitize(*w)).sum();
    let equal = total_weight <= 0.0;
    let norm = if equal { ordered.len() as f64 } else { total_weight };

    let mut acc = vec![0.0f64; len];
    for (_, weight, data) in ordered {
        let w = if equal { 1.0 } else { sanitize(*weight) };
        if w == 0.0 {
            continue;
        }
        for (slot, value) in acc.iter_mut().zip(data.iter()) {
            *slot += w * f64::from(*value);
        }
    }

    Ok(acc.into_iter().map(|v| (v / norm) as f32).collect())
}

/// Reduce the contributions of exactly `live` for one part
///
/// Fails if any member of `live` is missing or sent the wrong length.
pub fn reduce_part(
    contributions: &HashMap<PeerId, PartContribution>,
    live: &[PeerId],
    expected_len: usize,
) -> Result<Vec<f32>> {
    let mut inputs = Vec::with_capacity(live.len());
    for peer in live {
        let contribution = contributions.get(peer).ok_or_else(|| Error::PeerDroppedMidRound {
            peer_id: peer.to_hex(),
            group_id: String::new(),
        })?;
        if contribution.data.len() != expected_len {
            return Err(Error::ProtocolMalformed {
                message: format!(
                    "part from {} has {} elements, expected {}",
                    peer.short(),
                    contribution.data.len(),
                    expected_len
                ),
            });
        }
        inputs.push((*peer, contribution.weight, contribution.data.as_slice()));
    }
    weighted_average(&inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_equal_weights() {
        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
        let result = weighted_average(&[
            (a, 1.0, &[10.0][..]),
            (b, 1.0, &[20.0][..]),
            (c, 1.0, &[30.0][..]),
        ])
        .unwrap();
        assert_eq!(result, vec![20.0]);
    }

    #[test]
    fn test_weights_renormalized() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let result = weighted_average(&[(a, 1.0, &[0.0, 4.0][..]), (b, 3.0, &[4.0, 8.0][..])]).unwrap();
        assert!(approx_eq(&result, &[3.0, 7.0]));
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_equal() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let result = weighted_average(&[(a, 0.0, &[2.0][..]), (b, 0.0, &[4.0][..])]).unwrap();
        assert_eq!(result, vec![3.0]);
    }

    #[test]
    fn test_zero_weight_member_ignored() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let result = weighted_average(&[(a, 0.0, &[100.0][..]), (b, 2.0, &[4.0][..])]).unwrap();
        assert_eq!(result, vec![4.0]);
    }

    #[test]
    fn test_order_does_not_matter() {
        let inputs: Vec<(PeerId, f64, Vec<f32>)> = (0..7)
            .map(|i| {
                let data = (0..16).map(|j| (i * 16 + j) as f32 * 0.1137).collect();
                (PeerId::random(), 0.5 + i as f64, data)
            })
            .collect();

        let forward: Vec<(PeerId, f64, &[f32])> =
            inputs.iter().map(|(p, w, d)| (*p, *w, d.as_slice())).collect();
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(weighted_average(&forward).unwrap(), weighted_average(&reversed).unwrap());
    }

    #[test]
    fn test_matches_manual_mean() {
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let weights = [1.0, 2.0, 0.5, 4.0];
        let values = [1.5f32, -2.0, 8.0, 0.25];

        let inputs: Vec<(PeerId, f64, Vec<f32>)> = peers
            .iter()
            .zip(weights)
            .zip(values)
            .map(|((p, w), v)| (*p, w, vec![v]))
            .collect();
        let borrowed: Vec<(PeerId, f64, &[f32])> =
            inputs.iter().map(|(p, w, d)| (*p, *w, d.as_slice())).collect();

        let manual: f64 = weights.iter().zip(values).map(|(w, v)| w * v as f64).sum::<f64>()
            / weights.iter().sum::<f64>();
        let result = weighted_average(&borrowed).unwrap();
        assert!((result[0] as f64 - manual).abs() < 1e-6);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let (a, b) = (PeerId::random(), PeerId::random());
        assert!(weighted_average(&[(a, 1.0, &[1.0][..]), (b, 1.0, &[1.0, 2.0][..])]).is_err());
        assert!(weighted_average(&[]).is_err());
    }

    #[test]
    fn test_reduce_part_requires_every_live_member() {
        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
        let mut contributions = HashMap::new();
        contributions.insert(a, PartContribution { weight: 1.0, data: vec![10.0] });
        contributions.insert(b, PartContribution { weight: 1.0, data: vec![20.0] });
        contributions.insert(c, PartContribution { weight: 1.0, data: vec![30.0] });

        // Only the live set counts, even if more arrived
        assert_eq!(reduce_part(&contributions, &[a, b], 1).unwrap(), vec![15.0]);

        contributions.remove(&b);
        assert!(reduce_part(&contributions, &[a, b], 1).is_err());
    }
}
