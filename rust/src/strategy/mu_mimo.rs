//! MU-MIMO pairing: precoder orthogonality and the pairing admission test.

use rustc_hash::FxHashMap;

use crate::models::UeId;
use crate::{log_checks, log_debug};

use super::Candidate;

/// Pairing thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MuMimoParams {
    /// A UE needing fewer RBs than this is not worth pairing.
    pub min_rbs: u16,
    pub min_cqi: u8,
    /// Largest normalized precoder correlation a pair may have.
    pub semi_orthogonality: f64,
}

/// Pairwise normalized correlation `|<a, b>| / (|a| |b|)` of UE precoders.
#[derive(Clone, Debug, Default)]
pub struct OrthogonalityMatrix {
    index: FxHashMap<UeId, usize>,
    correlation: Vec<f64>,
}

impl OrthogonalityMatrix {
    /// Build from UE precoder weights. Returns `None` unless at least two UEs
    /// report weights of the same dimension.
    pub fn from_precoders<'a, I>(precoders: I) -> Option<Self>
    where
        I: IntoIterator<Item = (UeId, &'a [(f32, f32)])>,
    {
        let mut entries: Vec<(UeId, &[(f32, f32)])> = precoders
            .into_iter()
            .filter(|(_, w)| norm(w) > 0.0)
            .collect();
        let dim = entries.first()?.1.len();
        entries.retain(|(_, w)| w.len() == dim);
        if entries.len() < 2 {
            return None;
        }
        entries.sort_unstable_by_key(|(ue, _)| *ue);

        let n = entries.len();
        let mut correlation = vec![1.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let c = normalized_correlation(entries[i].1, entries[j].1);
                correlation[i * n + j] = c;
                correlation[j * n + i] = c;
            }
        }
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (ue, _))| (*ue, i))
            .collect();
        Some(Self { index, correlation })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn correlation(&self, a: UeId, b: UeId) -> Option<f64> {
        let n = self.index.len();
        let i = *self.index.get(&a)?;
        let j = *self.index.get(&b)?;
        Some(self.correlation[i * n + j])
    }
}

fn norm(w: &[(f32, f32)]) -> f64 {
    w.iter()
        .map(|(re, im)| (*re as f64).powi(2) + (*im as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn normalized_correlation(a: &[(f32, f32)], b: &[(f32, f32)]) -> f64 {
    // <a, b> = sum(conj(a_k) * b_k)
    let (mut re, mut im) = (0.0f64, 0.0f64);
    for ((ar, ai), (br, bi)) in a.iter().zip(b) {
        let (ar, ai, br, bi) = (*ar as f64, *ai as f64, *br as f64, *bi as f64);
        re += ar * br + ai * bi;
        im += ar * bi - ai * br;
    }
    ((re * re + im * im).sqrt() / (norm(a) * norm(b))).min(1.0)
}

impl MuMimoParams {
    /// Whether `c` may take part in a pair at all.
    pub fn is_capable(&self, c: &Candidate) -> bool {
        c.mu_mcs.is_some()
            && c.su_req_rbs >= self.min_rbs
            && c.wideband_cqi >= self.min_cqi
    }

    /// Whether `a` and `b` may share RBs.
    ///
    /// The pair must be near-orthogonal with equal rank and beam. The worst
    /// MU requirement of the two must reach the minimum RB count and stay
    /// below each UE's single-user requirement; a pair that needs as many RBs
    /// per UE as single-user service gains no TBS and is refused.
    pub fn can_pair(
        &self,
        a: &Candidate,
        b: &Candidate,
        matrix: &OrthogonalityMatrix,
        verbosity: u8,
    ) -> bool {
        if a.ue == b.ue || !self.is_capable(a) || !self.is_capable(b) {
            return false;
        }
        if a.rank != b.rank || a.beam_id != b.beam_id {
            log_debug!(verbosity, "MU pair {}/{}: rank or beam differ", a.ue, b.ue);
            return false;
        }
        let Some(corr) = matrix.correlation(a.ue, b.ue) else {
            return false;
        };
        if corr > self.semi_orthogonality {
            log_debug!(
                verbosity,
                "MU pair {}/{}: correlation {:.3} above {:.3}",
                a.ue,
                b.ue,
                corr,
                self.semi_orthogonality
            );
            return false;
        }
        let (Some(mu_a), Some(mu_b)) = (a.mu_req_rbs, b.mu_req_rbs) else {
            return false;
        };
        let worst_mu = mu_a.max(mu_b);
        let accepted =
            worst_mu >= self.min_rbs && worst_mu < a.su_req_rbs && worst_mu < b.su_req_rbs;
        log_checks!(
            verbosity,
            "MU pair {}/{}: worst MU {} RBs vs SU {}/{} RBs -> {}",
            a.ue,
            b.ue,
            worst_mu,
            a.su_req_rbs,
            b.su_req_rbs,
            if accepted { "accept" } else { "reject" }
        );
        accepted
    }
}
