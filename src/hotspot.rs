use crate::git_mining::ChurnSnapshot;
use crate::model::SymbolKind;

#[derive(Debug, Clone)]
pub struct HotspotCandidate {
    pub qualname: String,
    pub file_path: String,
    pub kind: SymbolKind,
    pub complexity: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HotspotRow {
    pub qualname: String,
    pub complexity: i64,
    pub churn: i64,
    pub score: f64,
    pub rank: i64,
}

/// `complexity * (1 + sqrt(churn))`: never-changed code still ranks by
/// complexity, and frequent edits amplify it with diminishing returns.
pub fn score(complexity: i64, churn: i64) -> f64 {
    complexity.max(0) as f64 * (1.0 + (churn.max(0) as f64).sqrt())
}

/// Score every function and method, then rank by score descending with
/// qualname as the tie-break. Ranks are 1-based and contiguous.
pub fn compute_hotspots(candidates: &[HotspotCandidate], churn: &ChurnSnapshot) -> Vec<HotspotRow> {
    let mut rows: Vec<HotspotRow> = candidates
        .iter()
        .filter(|candidate| candidate.kind.is_callable())
        .map(|candidate| {
            let churn = churn.churn(&candidate.file_path);
            HotspotRow {
                qualname: candidate.qualname.clone(),
                complexity: candidate.complexity,
                churn,
                score: score(candidate.complexity, churn),
                rank: 0,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.qualname.cmp(&b.qualname))
    });
    for (idx, row) in rows.iter_mut().enumerate() {
        row.rank = idx as i64 + 1;
    }
    rows
}
