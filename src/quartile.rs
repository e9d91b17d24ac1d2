use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::models::Department;

pub const QUARTILES: usize = 4;

/// Secondary risk metrics departments are banded by before DIST scores are
/// compared inside a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMetric {
    ResidentialFires,
    GreaterThanSize2,
    DeathsInjuries,
}

impl RiskMetric {
    pub const ALL: [RiskMetric; 3] = [
        RiskMetric::ResidentialFires,
        RiskMetric::GreaterThanSize2,
        RiskMetric::DeathsInjuries,
    ];

    pub fn value(self, department: &Department) -> Option<f64> {
        match self {
            RiskMetric::ResidentialFires => department.residential_fires_avg_3_years,
            RiskMetric::GreaterThanSize2 => coalesce_sum(
                department.risk_model_fires_size1_percentage,
                department.risk_model_fires_size2_percentage,
            ),
            RiskMetric::DeathsInjuries => {
                coalesce_sum(department.risk_model_deaths, department.risk_model_injuries)
            }
        }
    }

    /// Bands `population` into quartiles of this metric. Sum metrics band
    /// zero and non-zero sums separately, each with its own four buckets.
    pub fn band(self, population: &[Department]) -> QuartileAssignment {
        let entries = population
            .iter()
            .map(|department| (department.id, self.value(department)));
        match self {
            RiskMetric::ResidentialFires => assign_quartiles(entries),
            RiskMetric::GreaterThanSize2 | RiskMetric::DeathsInjuries => {
                assign_partitioned_quartiles(entries, |value| value != 0.0)
            }
        }
    }
}

/// Sum of two nullable fields; absent only when both are.
fn coalesce_sum(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
    }
}

/// Sizes of `buckets` contiguous buckets over `n` ranked members. The first
/// `n % buckets` buckets take one extra member.
pub fn bucket_sizes(n: usize, buckets: usize) -> Vec<usize> {
    if buckets == 0 {
        return Vec::new();
    }
    let base = n / buckets;
    let extra = n % buckets;
    (0..buckets)
        .map(|index| base + usize::from(index < extra))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuartileAssignment {
    ranks: HashMap<i64, u8>,
    breaks: Vec<f64>,
}

impl QuartileAssignment {
    pub fn rank_of(&self, id: i64) -> Option<u8> {
        self.ranks.get(&id).copied()
    }

    /// Largest value of each populated bucket, ascending.
    pub fn breaks(&self) -> &[f64] {
        &self.breaks
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn bucket_len(&self, quartile: u8) -> usize {
        self.ranks.values().filter(|rank| **rank == quartile).count()
    }

    pub fn mean_rank(&self) -> Option<f64> {
        if self.ranks.is_empty() {
            return None;
        }
        let total: u32 = self.ranks.values().map(|rank| u32::from(*rank)).sum();
        Some(f64::from(total) / self.ranks.len() as f64)
    }
}

/// Ranks each partition of `entries` into its own quartiles. Breaks hold the
/// largest value carrying each quartile number across all partitions.
pub fn assign_partitioned_quartiles<I, K, F>(entries: I, partition: F) -> QuartileAssignment
where
    I: IntoIterator<Item = (i64, Option<f64>)>,
    K: Ord,
    F: Fn(f64) -> K,
{
    let mut partitions: BTreeMap<K, Vec<(i64, Option<f64>)>> = BTreeMap::new();
    for (id, value) in entries {
        if let Some(value) = value {
            partitions
                .entry(partition(value))
                .or_default()
                .push((id, Some(value)));
        }
    }

    let mut merged = QuartileAssignment::default();
    for members in partitions.into_values() {
        let assignment = assign_quartiles(members);
        for (index, max) in assignment.breaks.iter().enumerate() {
            match merged.breaks.get_mut(index) {
                Some(current) => *current = current.max(*max),
                None => merged.breaks.push(*max),
            }
        }
        merged.ranks.extend(assignment.ranks);
    }
    merged
}

/// Ranks `entries` into quartiles by value. Entries without a value are left
/// out; equal values keep their input order.
pub fn assign_quartiles<I>(entries: I) -> QuartileAssignment
where
    I: IntoIterator<Item = (i64, Option<f64>)>,
{
    let mut present: Vec<(i64, f64)> = entries
        .into_iter()
        .filter_map(|(id, value)| value.map(|value| (id, value)))
        .collect();
    present.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut assignment = QuartileAssignment::default();
    let mut cursor = 0usize;
    for (index, size) in bucket_sizes(present.len(), QUARTILES).into_iter().enumerate() {
        if size == 0 {
            continue;
        }
        let bucket = &present[cursor..cursor + size];
        let quartile = (index + 1) as u8;
        for (id, _) in bucket {
            assignment.ranks.insert(*id, quartile);
        }
        if let Some((_, max)) = bucket.last() {
            assignment.breaks.push(*max);
        }
        cursor += size;
    }

    assignment
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortRanking {
    /// Subject's secondary-metric quartile; the cohort is every scored
    /// department sharing it.
    pub secondary_quartile: u8,
    /// DIST quartile inside the cohort, `None` when the subject is unscored.
    pub quartile: Option<u8>,
    pub cohort_size: usize,
    pub average_quartile: Option<f64>,
    pub breaks: Vec<f64>,
}

/// Bands `population` by `metric`, then ranks the DIST scores of every
/// department carrying the subject's quartile number.
pub fn rank_in_cohort(
    subject: &Department,
    population: &[Department],
    metric: RiskMetric,
) -> Option<CohortRanking> {
    let secondary = metric.band(population);
    let secondary_quartile = secondary.rank_of(subject.id)?;

    let cohort = assign_quartiles(
        population
            .iter()
            .filter(|department| department.dist_model_score.is_some())
            .filter(|department| secondary.rank_of(department.id) == Some(secondary_quartile))
            .map(|department| (department.id, department.dist_model_score)),
    );

    Some(CohortRanking {
        secondary_quartile,
        quartile: subject
            .dist_model_score
            .and_then(|_| cohort.rank_of(subject.id)),
        cohort_size: cohort.len(),
        average_quartile: cohort.mean_rank(),
        breaks: cohort.breaks().to_vec(),
    })
}

/// Ranking against peers of the same population class.
pub fn rank_peer(
    subject: &Department,
    peers: &[Department],
    metric: RiskMetric,
) -> Option<CohortRanking> {
    rank_in_cohort(subject, peers, metric)
}

/// Ranking against every scored department in the country.
pub fn rank_national(
    subject: &Department,
    all_scored: &[Department],
    metric: RiskMetric,
) -> Option<CohortRanking> {
    subject.dist_model_score?;
    let scored: Vec<Department> = all_scored
        .iter()
        .filter(|department| department.dist_model_score.is_some())
        .cloned()
        .collect();
    rank_in_cohort(subject, &scored, metric)
}

/// DIST quartile over the whole scored population, without banding.
pub fn national_dist_quartile(subject: &Department, all_scored: &[Department]) -> Option<u8> {
    subject.dist_model_score?;
    assign_quartiles(
        all_scored
            .iter()
            .map(|department| (department.id, department.dist_model_score)),
    )
    .rank_of(subject.id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PopulationStats {
    pub population_class: Option<i16>,
    pub department_count: usize,
    pub scored_count: usize,
    pub dist_min: Option<f64>,
    pub dist_max: Option<f64>,
    pub dist_mean: Option<f64>,
    pub population_min: Option<i64>,
    pub population_max: Option<i64>,
}

pub fn population_stats(population_class: Option<i16>, peers: &[Department]) -> PopulationStats {
    let scores: Vec<f64> = peers.iter().filter_map(|d| d.dist_model_score).collect();
    let populations: Vec<i64> = peers.iter().filter_map(|d| d.population).collect();

    PopulationStats {
        population_class,
        department_count: peers.len(),
        scored_count: scores.len(),
        dist_min: scores.iter().copied().reduce(f64::min),
        dist_max: scores.iter().copied().reduce(f64::max),
        dist_mean: if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        },
        population_min: populations.iter().copied().min(),
        population_max: populations.iter().copied().max(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricReport {
    pub metric: RiskMetric,
    /// Largest metric value of each peer band, for chart thresholds.
    pub risk_breaks: Vec<f64>,
    pub peer: Option<CohortRanking>,
    pub national: Option<CohortRanking>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportCard {
    pub population_stats: PopulationStats,
    pub national_dist_quartile: Option<u8>,
    pub metrics: Vec<MetricReport>,
}

pub fn build_report_card(
    subject: &Department,
    peers: &[Department],
    all_scored: &[Department],
) -> ReportCard {
    let metrics = RiskMetric::ALL
        .into_iter()
        .map(|metric| MetricReport {
            metric,
            risk_breaks: metric.band(peers).breaks().to_vec(),
            peer: rank_peer(subject, peers, metric),
            national: rank_national(subject, all_scored, metric),
        })
        .collect();

    ReportCard {
        population_stats: population_stats(subject.population_class, peers),
        national_dist_quartile: national_dist_quartile(subject, all_scored),
        metrics,
    }
}
