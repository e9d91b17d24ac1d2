use std::fmt::Write;

use crate::models::Department;
use crate::quartile::{CohortRanking, ReportCard, RiskMetric};

pub fn metric_label(metric: RiskMetric) -> &'static str {
    match metric {
        RiskMetric::ResidentialFires => "Residential fires (3 year average)",
        RiskMetric::GreaterThanSize2 => "Fires spreading beyond the room of origin",
        RiskMetric::DeathsInjuries => "Deaths and injuries",
    }
}

fn format_score(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |value| format!("{value:.2}"))
}

fn format_ranking(ranking: Option<&CohortRanking>) -> String {
    match ranking {
        None => "not ranked".to_string(),
        Some(ranking) => {
            let quartile = ranking
                .quartile
                .map_or_else(|| "unscored".to_string(), |q| format!("quartile {q}"));
            format!(
                "{} of {} in risk band {}",
                quartile, ranking.cohort_size, ranking.secondary_quartile
            )
        }
    }
}

/// Markdown summary of a department's DIST standing.
pub fn build_report(department: &Department, card: &ReportCard) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# DIST Report Card: {}", department.name);
    let _ = writeln!(
        output,
        "Department {} ({}) population {}",
        department.id,
        department.state.as_deref().unwrap_or("unknown state"),
        department
            .population
            .map_or_else(|| "unknown".to_string(), |p| p.to_string())
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## DIST Score");
    let _ = writeln!(output, "- Score: {}", format_score(department.dist_model_score));
    match card.national_dist_quartile {
        Some(quartile) => {
            let _ = writeln!(output, "- National quartile: {quartile}");
        }
        None => {
            let _ = writeln!(output, "- National quartile: not scored");
        }
    }

    let stats = &card.population_stats;
    let _ = writeln!(output);
    let _ = writeln!(output, "## Population Class");
    if stats.department_count == 0 {
        let _ = writeln!(output, "No departments share this population class.");
    } else {
        let _ = writeln!(
            output,
            "- {} departments, {} scored",
            stats.department_count, stats.scored_count
        );
        let _ = writeln!(
            output,
            "- DIST range {} to {} (mean {})",
            format_score(stats.dist_min),
            format_score(stats.dist_max),
            format_score(stats.dist_mean)
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Bands");
    for metric in &card.metrics {
        let _ = writeln!(
            output,
            "- {}: peers {}; national {}",
            metric_label(metric.metric),
            format_ranking(metric.peer.as_ref()),
            format_ranking(metric.national.as_ref())
        );
    }

    output
}
